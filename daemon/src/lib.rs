//! The node side of Warden
//!
//! A daemon owns this node's real dataplane and replays goal state events
//! from the controller onto it: deltas as they stream in, and a full
//! hydration snapshot every time the connection is rebuilt.

mod args;
mod libs;

pub use args::Args;
pub use libs::{Daemon, GoalStateProcessor, client};
