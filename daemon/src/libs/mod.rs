pub mod client;
pub mod daemon;
pub mod processor;

pub use daemon::Daemon;
pub use processor::GoalStateProcessor;
