//! The Windows endpoint cache
//!
//! Maps pod IPs to the HNS endpoints that front them. Pods and endpoints race
//! each other on the same IP, so an endpoint keeps the identity of its last
//! pod around as a stale key for a few minutes. Out of order delete/create
//! events for the same IP can then be told apart from genuine reassignment.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{Level, event};

use warden::Error;

use crate::hns::HnsEndpoint;

/// A pod identity an endpoint used to carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalePodKey {
    /// The namespace/name key the endpoint was bound to
    pub key: String,
    /// When the binding went stale
    pub since: DateTime<Utc>,
}

/// One local endpoint as the dataplane tracks it
#[derive(Debug, Clone)]
pub struct NpmEndpoint {
    /// The HNS id of this endpoint
    pub id: String,
    /// The HNS name of this endpoint
    pub name: String,
    /// The pod IP attached to this endpoint
    pub ip: String,
    /// The namespace/name key of the owning pod, empty while unknown
    pub pod_key: String,
    /// The previous owner if one went away recently
    pub stale_pod_key: Option<StalePodKey>,
    /// The keys of the policies installed on this endpoint
    pub netpol_references: HashSet<String>,
}

impl NpmEndpoint {
    /// Wrap a fresh HNS endpoint with no known pod
    ///
    /// # Arguments
    ///
    /// * `raw` - The endpoint as HNS reported it
    fn new(raw: &HnsEndpoint) -> Self {
        NpmEndpoint {
            id: raw.id.clone(),
            name: raw.name.clone(),
            ip: raw.ip.clone(),
            pod_key: String::default(),
            stale_pod_key: None,
            netpol_references: HashSet::default(),
        }
    }
}

/// What claiming an endpoint for a pod decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The endpoint now belongs to the pod
    Claimed,
    /// The pod was already reassigned away from this endpoint
    Reassigned,
    /// No endpoint fronts this IP
    Missing,
}

/// The ip to endpoint cache
#[derive(Debug, Default)]
pub struct EndpointCache {
    /// Every known local endpoint keyed by pod IP
    endpoints: HashMap<String, NpmEndpoint>,
    /// How many minutes a stale pod key is kept
    stale_minutes: i64,
}

impl EndpointCache {
    /// Create an empty cache
    ///
    /// # Arguments
    ///
    /// * `stale_minutes` - How many minutes to keep stale pod keys
    pub fn new(stale_minutes: i64) -> Self {
        EndpointCache {
            endpoints: HashMap::default(),
            stale_minutes,
        }
    }

    /// Get an endpoint by the pod IP it fronts
    ///
    /// # Arguments
    ///
    /// * `ip` - The pod IP to look up
    pub fn get(&self, ip: &str) -> Option<&NpmEndpoint> {
        self.endpoints.get(ip)
    }

    /// Get a mutable endpoint by the pod IP it fronts
    ///
    /// # Arguments
    ///
    /// * `ip` - The pod IP to look up
    pub fn get_mut(&mut self, ip: &str) -> Option<&mut NpmEndpoint> {
        self.endpoints.get_mut(ip)
    }

    /// Iterate every cached endpoint
    pub fn iter(&self) -> impl Iterator<Item = &NpmEndpoint> {
        self.endpoints.values()
    }

    /// Get the endpoint ids for a set of pod IPs
    ///
    /// # Arguments
    ///
    /// * `ips` - The pod IPs to resolve
    pub fn resolve(&self, ips: &HashSet<String>) -> HashMap<String, String> {
        ips.iter()
            .filter_map(|ip| {
                self.endpoints
                    .get(ip)
                    .map(|endpoint| (ip.clone(), endpoint.id.clone()))
            })
            .collect()
    }

    /// Reconcile the cache against a fresh HNS endpoint listing
    ///
    /// Remote endpoints are ignored. A known IP whose endpoint id changed gets
    /// a fresh entry and its old pod identity becomes a stale key. Cached IPs
    /// absent from the listing demote their pod to a stale key, and entries
    /// whose stale key has aged out are dropped.
    ///
    /// # Arguments
    ///
    /// * `fresh` - The endpoints HNS reported
    /// * `now` - The time to stamp and age stale keys with
    pub fn refresh(&mut self, fresh: Vec<HnsEndpoint>, now: DateTime<Utc>) {
        let mut seen: HashSet<String> = HashSet::with_capacity(fresh.len());
        for raw in fresh.into_iter().filter(|raw| !raw.is_remote) {
            seen.insert(raw.ip.clone());
            match self.endpoints.get_mut(&raw.ip) {
                None => {
                    self.endpoints.insert(raw.ip.clone(), NpmEndpoint::new(&raw));
                }
                Some(cached) if cached.id != raw.id => {
                    // the ip moved to a new endpoint, keep the old pod as stale
                    let mut fresh_entry = NpmEndpoint::new(&raw);
                    if !cached.pod_key.is_empty() {
                        fresh_entry.stale_pod_key = Some(StalePodKey {
                            key: cached.pod_key.clone(),
                            since: now,
                        });
                    } else {
                        fresh_entry.stale_pod_key = cached.stale_pod_key.clone();
                    }
                    event!(
                        Level::DEBUG,
                        ip = %raw.ip,
                        old = %cached.id,
                        new = %raw.id,
                        "endpoint replaced under a live ip"
                    );
                    *cached = fresh_entry;
                }
                Some(_) => (),
            }
        }
        // age out everything hns no longer reports
        self.endpoints.retain(|ip, cached| {
            if seen.contains(ip) {
                return true;
            }
            if !cached.pod_key.is_empty() {
                cached.stale_pod_key = Some(StalePodKey {
                    key: std::mem::take(&mut cached.pod_key),
                    since: now,
                });
                return true;
            }
            match &cached.stale_pod_key {
                Some(stale) => now.signed_duration_since(stale.since).num_minutes() < self.stale_minutes,
                None => false,
            }
        });
    }

    /// Bind an endpoint to a pod, refusing mismatched claims
    ///
    /// # Arguments
    ///
    /// * `ip` - The pod IP to claim
    /// * `pod_key` - The namespace/name key of the claiming pod
    pub fn claim(&mut self, ip: &str, pod_key: &str) -> Result<Claim, Error> {
        let Some(endpoint) = self.endpoints.get_mut(ip) else {
            return Ok(Claim::Missing);
        };
        // a stale key for this pod means the ip has since been reassigned
        if endpoint
            .stale_pod_key
            .as_ref()
            .is_some_and(|stale| stale.key == pod_key)
        {
            return Ok(Claim::Reassigned);
        }
        if endpoint.pod_key.is_empty() {
            endpoint.pod_key = pod_key.to_owned();
            return Ok(Claim::Claimed);
        }
        if endpoint.pod_key == pod_key {
            return Ok(Claim::Claimed);
        }
        Err(Error::EndpointMismatch {
            ip: ip.to_owned(),
            bound: endpoint.pod_key.clone(),
            claim: pod_key.to_owned(),
        })
    }

    /// Release an endpoint when its pod goes away
    ///
    /// The pod identity is kept as a stale key so late events for the old pod
    /// stay idempotent.
    ///
    /// # Arguments
    ///
    /// * `ip` - The pod IP to release
    /// * `pod_key` - The namespace/name key of the departing pod
    /// * `now` - The time to stamp the stale key with
    pub fn release(&mut self, ip: &str, pod_key: &str, now: DateTime<Utc>) {
        if let Some(endpoint) = self.endpoints.get_mut(ip) {
            if endpoint.pod_key == pod_key {
                endpoint.pod_key = String::default();
                endpoint.stale_pod_key = Some(StalePodKey {
                    key: pod_key.to_owned(),
                    since: now,
                });
            }
        }
    }

    /// Drop a policy's reference from every endpoint carrying it
    ///
    /// Returns the endpoint ids that carried the policy.
    ///
    /// # Arguments
    ///
    /// * `policy_key` - The namespace/name key of the removed policy
    pub fn drop_policy(&mut self, policy_key: &str) -> Vec<String> {
        let mut carriers = Vec::default();
        for endpoint in self.endpoints.values_mut() {
            if endpoint.netpol_references.remove(policy_key) {
                carriers.push(endpoint.id.clone());
            }
        }
        carriers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    /// Shorthand for an hns endpoint
    fn hns_ep(id: &str, ip: &str) -> HnsEndpoint {
        HnsEndpoint {
            id: id.to_owned(),
            name: id.to_owned(),
            ip: ip.to_owned(),
            is_remote: false,
        }
    }

    #[test]
    fn refresh_discovers_and_replaces() {
        let mut cache = EndpointCache::new(10);
        let now = Utc::now();
        cache.refresh(vec![hns_ep("test1", "10.0.0.1")], now);
        assert_eq!(cache.get("10.0.0.1").unwrap().id, "test1");
        assert!(cache.get("10.0.0.1").unwrap().pod_key.is_empty());
        // a pod claims it, then the endpoint is replaced under the same ip
        cache.claim("10.0.0.1", "x/a").unwrap();
        cache.refresh(vec![hns_ep("test2", "10.0.0.1")], now);
        let cached = cache.get("10.0.0.1").unwrap();
        assert_eq!(cached.id, "test2");
        assert!(cached.pod_key.is_empty());
        assert_eq!(cached.stale_pod_key.as_ref().unwrap().key, "x/a");
    }

    #[test]
    fn refresh_ignores_remote_endpoints() {
        let mut cache = EndpointCache::new(10);
        let mut remote = hns_ep("far", "10.0.0.9");
        remote.is_remote = true;
        cache.refresh(vec![remote], Utc::now());
        assert!(cache.get("10.0.0.9").is_none());
    }

    #[test]
    fn vanished_endpoints_age_out() {
        let mut cache = EndpointCache::new(10);
        let now = Utc::now();
        cache.refresh(vec![hns_ep("test1", "10.0.0.1")], now);
        cache.claim("10.0.0.1", "x/a").unwrap();
        // the endpoint vanishes, its pod demotes to a stale key
        cache.refresh(Vec::default(), now);
        let cached = cache.get("10.0.0.1").unwrap();
        assert!(cached.pod_key.is_empty());
        assert_eq!(cached.stale_pod_key.as_ref().unwrap().key, "x/a");
        // within the retention window the entry survives
        cache.refresh(Vec::default(), now + Duration::minutes(5));
        assert!(cache.get("10.0.0.1").is_some());
        // past the retention window it is dropped
        cache.refresh(Vec::default(), now + Duration::minutes(11));
        assert!(cache.get("10.0.0.1").is_none());
    }

    #[test]
    fn claims_enforce_ownership() {
        let mut cache = EndpointCache::new(10);
        let now = Utc::now();
        cache.refresh(vec![hns_ep("test1", "10.0.0.1")], now);
        assert_eq!(cache.claim("10.0.0.1", "x/a").unwrap(), Claim::Claimed);
        // the same pod may claim again
        assert_eq!(cache.claim("10.0.0.1", "x/a").unwrap(), Claim::Claimed);
        // a different pod claiming a bound endpoint is a mismanagement error
        let out = cache.claim("10.0.0.1", "x/b");
        assert!(matches!(out, Err(Error::EndpointMismatch { .. })));
        // no endpoint means the event is simply skipped
        assert_eq!(cache.claim("10.0.0.2", "x/c").unwrap(), Claim::Missing);
    }

    #[test]
    fn stale_keys_mark_reassignment() {
        let mut cache = EndpointCache::new(10);
        let now = Utc::now();
        cache.refresh(vec![hns_ep("test1", "10.0.0.1")], now);
        cache.claim("10.0.0.1", "x/a").unwrap();
        // pod a leaves, pod b arrives on the same ip through a new endpoint
        cache.refresh(vec![hns_ep("test2", "10.0.0.1")], now);
        // a late event for pod a must see the reassignment
        assert_eq!(cache.claim("10.0.0.1", "x/a").unwrap(), Claim::Reassigned);
        // pod b can still claim the endpoint
        assert_eq!(cache.claim("10.0.0.1", "x/b").unwrap(), Claim::Claimed);
    }
}
