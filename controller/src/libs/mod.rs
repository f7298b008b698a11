pub mod cache;
pub mod controllers;
pub mod queue;
pub mod server;
pub mod shim;
pub mod supervisor;
pub mod translate;

pub use cache::SharedCache;
pub use queue::WorkQueue;
pub use server::GoalServer;
pub use shim::DpShim;
pub use supervisor::Supervisor;
