//! The cluster side of Warden
//!
//! Three watch driven controllers translate Pod, Namespace, and NetworkPolicy
//! objects into dataplane mutations. In direct mode they program the node's
//! own dataplane; in remote mode they program a goal state shim whose deltas
//! stream to per node daemons.

mod args;
mod libs;

pub use args::{Args, Mode};
pub use libs::{DpShim, GoalServer, SharedCache, Supervisor, WorkQueue, controllers, translate};
