//! Wrappers for all objects within Warden

pub mod goalstate;
pub mod ipsets;
pub mod namespaces;
pub mod netpols;
pub mod pods;

pub use goalstate::{
    Events, EventType, GoalState, IpSetSnapshot, POLICY_APPLY, POLICY_REMOVE, SET_APPLY,
    SET_REMOVE,
};
pub use ipsets::{
    ALL_NAMESPACES, DeleteOption, EMPTY_HASH_SET, IpSetMetadata, ReferenceKind, SetKind, SetType,
    TranslatedIpSet, hashed_name,
};
pub use namespaces::NpmNamespace;
pub use netpols::{AclPolicy, Direction, NpmNetworkPolicy, Ports, Protocol, SetInfo, Verdict};
pub use pods::{NamedPort, NpmPod, PodMetadata};
