//! The shared models, config, and utilities for Warden
//!
//! Warden translates Kubernetes NetworkPolicy, Pod, and Namespace objects into
//! node local firewall state. This crate carries the pieces shared by the
//! controller and the node daemon: the in-memory object models, the goal state
//! wire format, the config file layout, and error/retry plumbing.

#[macro_use]
extern crate serde_derive;

pub mod conf;
pub mod errors;
pub mod models;
pub mod utils;

pub use conf::Conf;
pub use errors::Error;
