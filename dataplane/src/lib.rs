//! The node local dataplane for Warden
//!
//! Controllers mutate an in-memory graph of IP sets and translated policies
//! through the [`Dataplane`] trait; nothing reaches the platform until
//! `apply_dataplane` flushes the dirty state. Two backends program the real
//! firewall: ipset + iptables-restore on Linux and HNS SetPolicies/endpoint
//! ACLs on Windows.

#[macro_use]
extern crate serde_derive;

mod dataplane;
pub mod endpoints;
pub mod hns;
pub mod ipsets;
pub mod platform;
pub mod policies;
pub mod restore;

pub use dataplane::{Backend, DataPlane, Dataplane, PodUpdate};
pub use ipsets::{DirtyCache, IpSetManager};
pub use platform::backend_from_conf;
pub use policies::PolicyManager;

// expose the platform fakes if that feature is enabled
#[cfg(feature = "test-utilities")]
pub mod test_utilities;
