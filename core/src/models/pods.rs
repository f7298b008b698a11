//! The structure for pods
//!
//! The pod controller keeps one [`NpmPod`] per live pod with a usable IP and
//! diffs incoming pod events against it so only changed labels, ports, or IPs
//! reach the dataplane.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::Error;

/// The identity a hash set member carries
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PodMetadata {
    /// The pod IP, optionally suffixed with a ,port for named port sets
    pub ip: String,
    /// The namespace/name key of the owning pod
    pub pod_key: String,
    /// The node the pod runs on
    pub node_name: String,
}

impl PodMetadata {
    /// Create new pod metadata
    ///
    /// # Arguments
    ///
    /// * `ip` - The pod IP
    /// * `pod_key` - The namespace/name key of the owning pod
    /// * `node_name` - The node the pod runs on
    pub fn new<I: Into<String>, K: Into<String>, N: Into<String>>(
        ip: I,
        pod_key: K,
        node_name: N,
    ) -> Self {
        PodMetadata {
            ip: ip.into(),
            pod_key: pod_key.into(),
            node_name: node_name.into(),
        }
    }

    /// Make sure the IP portion of this member parses as IPv4
    ///
    /// Members may carry a trailing `,port` for named port sets; only the
    /// address part is validated.
    pub fn validate_ipv4(&self) -> Result<(), Error> {
        let addr = self.ip.split(',').next().unwrap_or(&self.ip);
        if Ipv4Addr::from_str(addr).is_err() {
            return Err(Error::validation(format!(
                "{} is not a usable IPv4 member",
                self.ip
            )));
        }
        Ok(())
    }
}

/// A named container port a pod exposes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NamedPort {
    /// The name the port is referenced by in policies
    pub name: String,
    /// The port number
    pub port: u16,
    /// The protocol the port speaks
    pub protocol: String,
}

/// The pod state the pod controller caches
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct NpmPod {
    /// The namespace this pod lives in
    pub namespace: String,
    /// The name of this pod
    pub name: String,
    /// The IP assigned to this pod
    pub pod_ip: String,
    /// The node this pod runs on
    pub node_name: String,
    /// The labels on this pod
    pub labels: BTreeMap<String, String>,
    /// The named container ports this pod exposes
    pub container_ports: Vec<NamedPort>,
    /// The lifecycle phase this pod is in
    pub phase: String,
}

impl NpmPod {
    /// Get the namespace/name key of this pod
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Get the pod metadata hash set members carry for this pod
    pub fn metadata(&self) -> PodMetadata {
        PodMetadata::new(&self.pod_ip, self.key(), &self.node_name)
    }

    /// Whether a fresh event for this pod changes nothing we track
    ///
    /// # Arguments
    ///
    /// * `fresh` - The pod state built from the incoming event
    pub fn no_update(&self, fresh: &NpmPod) -> bool {
        self.namespace == fresh.namespace
            && self.name == fresh.name
            && self.phase == fresh.phase
            && self.pod_ip == fresh.pod_ip
            && self.labels == fresh.labels
            && self.container_ports == fresh.container_ports
    }

    /// Whether this pod is in a terminal phase and should be torn down
    pub fn is_completed(&self) -> bool {
        self.phase == "Succeeded" || self.phase == "Failed"
    }

    /// Diff this pod's labels against a fresh label map
    ///
    /// Returns the key and key:value label pairs to remove and to add, in
    /// that order.
    ///
    /// # Arguments
    ///
    /// * `fresh` - The labels from the incoming event
    pub fn label_diff(&self, fresh: &BTreeMap<String, String>) -> (Vec<String>, Vec<String>) {
        let mut to_remove = Vec::new();
        let mut to_add = Vec::new();
        // drop any label pair the fresh set no longer carries
        for (key, value) in &self.labels {
            if fresh.get(key) != Some(value) {
                to_remove.push(key.clone());
                to_remove.push(format!("{key}:{value}"));
            }
        }
        // add any label pair we did not have yet
        for (key, value) in fresh {
            if self.labels.get(key) != Some(value) {
                to_add.push(key.clone());
                to_add.push(format!("{key}:{value}"));
            }
        }
        (to_remove, to_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a pod for tests
    fn pod(labels: &[(&str, &str)]) -> NpmPod {
        NpmPod {
            namespace: "x".to_owned(),
            name: "a".to_owned(),
            pod_ip: "10.0.0.1".to_owned(),
            node_name: "node-1".to_owned(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            container_ports: Vec::default(),
            phase: "Running".to_owned(),
        }
    }

    #[test]
    fn no_update_matches_identical_pods() {
        let cached = pod(&[("k1", "v1")]);
        let fresh = pod(&[("k1", "v1")]);
        assert!(cached.no_update(&fresh));
        // an IP change must not be a no-op
        let mut moved = pod(&[("k1", "v1")]);
        moved.pod_ip = "10.0.0.2".to_owned();
        assert!(!cached.no_update(&moved));
    }

    #[test]
    fn label_diff_tracks_key_and_pair_sets() {
        let cached = pod(&[("k1", "v1"), ("k2", "v2")]);
        let fresh = pod(&[("k1", "v9"), ("k3", "v3")]);
        let (removed, added) = cached.label_diff(&fresh.labels);
        assert_eq!(removed, vec!["k1", "k1:v1", "k2", "k2:v2"]);
        assert_eq!(added, vec!["k1", "k1:v9", "k3", "k3:v3"]);
    }

    #[test]
    fn ipv4_validation() {
        assert!(PodMetadata::new("10.0.0.1", "x/a", "n").validate_ipv4().is_ok());
        assert!(PodMetadata::new("10.0.0.1,8080", "x/a", "n").validate_ipv4().is_ok());
        assert!(PodMetadata::new("fd00::1", "x/a", "n").validate_ipv4().is_err());
        assert!(PodMetadata::new("", "x/a", "n").validate_ipv4().is_err());
    }
}
