//! The translated policy cache
//!
//! The manager owns every installed [`NpmNetworkPolicy`] and the generation
//! bookkeeping that distinguishes a re-created policy from its deleted
//! predecessor. Platform installs go through the linux/windows submodules.

use std::collections::HashMap;

use warden::models::NpmNetworkPolicy;

pub mod linux;
pub mod windows;

/// The translated policy cache
#[derive(Debug, Default)]
pub struct PolicyManager {
    /// Every installed policy keyed by namespace/name
    policies: HashMap<String, NpmNetworkPolicy>,
    /// The last generation of every removed policy
    deleted_objects: HashMap<String, u64>,
}

impl PolicyManager {
    /// Create an empty manager
    pub fn new() -> Self {
        PolicyManager::default()
    }

    /// Get a policy by its key
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the policy
    pub fn get(&self, key: &str) -> Option<&NpmNetworkPolicy> {
        self.policies.get(key)
    }

    /// Whether a policy is currently installed
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the policy
    pub fn exists(&self, key: &str) -> bool {
        self.policies.contains_key(key)
    }

    /// Get the keys of every installed policy
    pub fn keys(&self) -> Vec<String> {
        self.policies.keys().cloned().collect()
    }

    /// Get every installed policy whose selector includes a set
    ///
    /// # Arguments
    ///
    /// * `set_name` - The prefixed name of the selector set
    pub fn policies_selecting(&self, set_name: &str) -> Vec<&NpmNetworkPolicy> {
        self.policies
            .values()
            .filter(|policy| {
                policy
                    .selector_metadata()
                    .iter()
                    .any(|meta| meta.prefixed_name() == set_name)
            })
            .collect()
    }

    /// Record a policy in the cache, stamping generation and revision
    ///
    /// A policy that replaces an installed one keeps its generation and bumps
    /// its revision; a policy re-created after deletion starts one generation
    /// past where its predecessor died.
    ///
    /// # Arguments
    ///
    /// * `policy` - The policy to record
    pub fn stamp(&mut self, mut policy: NpmNetworkPolicy) -> NpmNetworkPolicy {
        let key = policy.key();
        match self.policies.get(&key) {
            Some(installed) => {
                policy.generation = installed.generation;
                policy.revision = installed.revision + 1;
            }
            None => {
                policy.generation = self.deleted_objects.get(&key).copied().unwrap_or_default() + 1;
                policy.revision = 1;
            }
        }
        self.policies.insert(key, policy.clone());
        policy
    }

    /// Drop a policy from the cache, remembering its generation
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the policy
    pub fn forget(&mut self, key: &str) -> Option<NpmNetworkPolicy> {
        let policy = self.policies.remove(key)?;
        self.deleted_objects.insert(key.to_owned(), policy.generation);
        Some(policy)
    }

    /// Update the cached endpoints of one policy
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the policy
    /// * `endpoints` - The fresh ip to endpoint id map
    pub fn set_endpoints(&mut self, key: &str, endpoints: HashMap<String, String>) {
        if let Some(policy) = self.policies.get_mut(key) {
            policy.pod_endpoints = endpoints;
        }
    }

    /// Record that a policy landed on one more endpoint
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the policy
    /// * `ip` - The pod IP the endpoint fronts
    /// * `endpoint_id` - The id of the endpoint
    pub fn add_endpoint(&mut self, key: &str, ip: &str, endpoint_id: &str) {
        if let Some(policy) = self.policies.get_mut(key) {
            policy
                .pod_endpoints
                .insert(ip.to_owned(), endpoint_id.to_owned());
        }
    }

    /// Record that a policy left one endpoint
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the policy
    /// * `ip` - The pod IP the endpoint fronts
    pub fn remove_endpoint(&mut self, key: &str, ip: &str) {
        if let Some(policy) = self.policies.get_mut(key) {
            policy.pod_endpoints.remove(ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden::models::{IpSetMetadata, SetType, TranslatedIpSet};

    /// Build a policy selecting one set
    fn policy(ns: &str, name: &str, selector: &str) -> NpmNetworkPolicy {
        NpmNetworkPolicy {
            namespace: ns.to_owned(),
            name: name.to_owned(),
            pod_selector_ipsets: vec![TranslatedIpSet::new(IpSetMetadata::new(
                selector,
                SetType::KeyValueLabelOfPod,
            ))],
            ..NpmNetworkPolicy::default()
        }
    }

    #[test]
    fn generations_and_revisions() {
        let mut mgr = PolicyManager::new();
        let stamped = mgr.stamp(policy("x", "base", "k1:v1"));
        assert_eq!((stamped.generation, stamped.revision), (1, 1));
        // an in-place update keeps the generation and bumps the revision
        let updated = mgr.stamp(policy("x", "base", "k2:v2"));
        assert_eq!((updated.generation, updated.revision), (1, 2));
        // a delete and re-create bumps the generation and resets the revision
        mgr.forget("x/base");
        let revived = mgr.stamp(policy("x", "base", "k1:v1"));
        assert_eq!((revived.generation, revived.revision), (2, 1));
    }

    #[test]
    fn selector_lookup_matches_prefixed_names() {
        let mut mgr = PolicyManager::new();
        mgr.stamp(policy("x", "base", "k1:v1"));
        mgr.stamp(policy("x", "other", "k2:v2"));
        let hits = mgr.policies_selecting("podlabel-k1:v1");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key(), "x/base");
        assert!(mgr.policies_selecting("podlabel-k9:v9").is_empty());
    }
}
