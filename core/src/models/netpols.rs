//! The structure for translated network policies
//!
//! A Kubernetes NetworkPolicy is translated into an [`NpmNetworkPolicy`]: the
//! sets it needs, the ACL rules to program, and (on Windows) the endpoints the
//! rules land on. The dataplane never sees Kubernetes types.

use std::collections::HashMap;

use super::ipsets::{IpSetMetadata, TranslatedIpSet};

/// What an ACL does to matched traffic
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Verdict {
    /// Let the traffic through
    Allowed,
    /// Drop the traffic
    Dropped,
}

/// Which way an ACL looks
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Direction {
    /// Traffic into the selected pods
    Ingress,
    /// Traffic out of the selected pods
    Egress,
}

/// The protocols an ACL can match
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString,
)]
pub enum Protocol {
    /// The TCP protocol
    #[strum(serialize = "TCP")]
    Tcp,
    /// The UDP protocol
    #[strum(serialize = "UDP")]
    Udp,
    /// The SCTP protocol
    #[strum(serialize = "SCTP")]
    Sctp,
    /// Any protocol
    #[strum(serialize = "ANY")]
    Any,
}

impl Protocol {
    /// Get the protocol number HNS ACLs carry
    pub fn number(&self) -> u16 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Sctp => 132,
            Protocol::Any => 256,
        }
    }
}

/// A destination port or port range an ACL matches
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ports {
    /// The port, or the first port of a range
    pub port: u16,
    /// The last port of a range if this is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,
}

impl Ports {
    /// Create a single port match
    ///
    /// # Arguments
    ///
    /// * `port` - The port to match
    pub fn single(port: u16) -> Self {
        Ports {
            port,
            end_port: None,
        }
    }

    /// Create a port range match
    ///
    /// # Arguments
    ///
    /// * `port` - The first port of the range
    /// * `end_port` - The last port of the range
    pub fn range(port: u16, end_port: u16) -> Self {
        Ports {
            port,
            end_port: Some(end_port),
        }
    }
}

/// A set an ACL matches traffic against
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SetInfo {
    /// The identity of the set
    pub metadata: IpSetMetadata,
    /// Whether matched traffic must be in the set or outside it
    pub included: bool,
}

impl SetInfo {
    /// Create a match on members of a set
    ///
    /// # Arguments
    ///
    /// * `metadata` - The identity of the set
    pub fn included(metadata: IpSetMetadata) -> Self {
        SetInfo {
            metadata,
            included: true,
        }
    }

    /// Create a match on everything outside a set
    ///
    /// # Arguments
    ///
    /// * `metadata` - The identity of the set
    pub fn excluded(metadata: IpSetMetadata) -> Self {
        SetInfo {
            metadata,
            included: false,
        }
    }
}

/// One platform rule a policy translates to
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AclPolicy {
    /// The id rules of this policy are tagged with on the platform
    pub policy_id: String,
    /// What this ACL does to matched traffic
    pub target: Verdict,
    /// Which way this ACL looks
    pub direction: Direction,
    /// The sets matched against the traffic source
    #[serde(default)]
    pub src_list: Vec<SetInfo>,
    /// The sets matched against the traffic destination
    #[serde(default)]
    pub dst_list: Vec<SetInfo>,
    /// The protocol to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// The destination ports to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Ports>,
}

impl AclPolicy {
    /// Create a new ACL with empty match lists
    ///
    /// # Arguments
    ///
    /// * `policy_id` - The id rules of this policy are tagged with
    /// * `target` - What this ACL does to matched traffic
    /// * `direction` - Which way this ACL looks
    pub fn new<T: Into<String>>(policy_id: T, target: Verdict, direction: Direction) -> Self {
        AclPolicy {
            policy_id: policy_id.into(),
            target,
            direction,
            src_list: Vec::default(),
            dst_list: Vec::default(),
            protocol: None,
            ports: None,
        }
    }
}

/// A translated network policy
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct NpmNetworkPolicy {
    /// The namespace the source policy lives in
    pub namespace: String,
    /// The name of the source policy
    pub name: String,
    /// The sets selecting the pods this policy applies to
    #[serde(default)]
    pub pod_selector_ipsets: Vec<TranslatedIpSet>,
    /// The sets named by this policy's rules
    #[serde(default)]
    pub rule_ipsets: Vec<TranslatedIpSet>,
    /// The platform rules this policy programs
    #[serde(default)]
    pub acls: Vec<AclPolicy>,
    /// The endpoints this policy lands on, keyed pod IP to endpoint id
    #[serde(default)]
    pub pod_endpoints: HashMap<String, String>,
    /// Bumped each time a policy of this key is re-created after deletion
    #[serde(default)]
    pub generation: u64,
    /// Bumped on every in-place update of this policy
    #[serde(default)]
    pub revision: u64,
}

impl NpmNetworkPolicy {
    /// Get the namespace/name key of this policy
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Get the id rules of this policy are tagged with on the platform
    pub fn acl_id(&self) -> String {
        format!("azure-acl-{}-{}", self.namespace, self.name)
    }

    /// Get the metadata of every selector set of this policy
    pub fn selector_metadata(&self) -> Vec<&IpSetMetadata> {
        self.pod_selector_ipsets
            .iter()
            .filter_map(|translated| translated.metadata.as_ref())
            .collect()
    }

    /// Get the metadata of every rule set of this policy
    pub fn rule_metadata(&self) -> Vec<&IpSetMetadata> {
        self.rule_ipsets
            .iter()
            .filter_map(|translated| translated.metadata.as_ref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_and_acl_ids() {
        let policy = NpmNetworkPolicy {
            namespace: "x".to_owned(),
            name: "base".to_owned(),
            ..Default::default()
        };
        assert_eq!(policy.key(), "x/base");
        assert_eq!(policy.acl_id(), "azure-acl-x-base");
    }

    #[test]
    fn protocol_numbers() {
        assert_eq!(Protocol::Tcp.number(), 6);
        assert_eq!(Protocol::Udp.number(), 17);
        assert_eq!(Protocol::Any.number(), 256);
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
    }
}
