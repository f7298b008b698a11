//! The controller side goal state shim
//!
//! Mirrors the dataplane API over the same in-memory graph, but instead of
//! touching any platform it records dirty deltas and emits them as encoded
//! [`Events`] to every connected daemon on apply. Freshly connected daemons
//! are hydrated with a full snapshot of the cache.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::{Mutex, mpsc};
use tracing::{Level, event};

use warden::Error;
use warden::models::{
    DeleteOption, EventType, Events, IpSetMetadata, IpSetSnapshot, NpmNetworkPolicy, PodMetadata,
    POLICY_APPLY, POLICY_REMOVE, ReferenceKind, SET_APPLY, SET_REMOVE, SetType,
};
use warden_dataplane::{Dataplane, IpSetManager, PodUpdate, PolicyManager};

/// The cache and dirty state behind one mutex
#[derive(Default)]
struct ShimState {
    /// The same set graph the node side dataplane keeps
    ipsets: IpSetManager,
    /// The same policy cache the node side dataplane keeps
    policies: PolicyManager,
    /// The policies to stream on the next apply
    dirty_policies: Vec<String>,
    /// The policy removals to stream on the next apply
    deleted_policies: Vec<String>,
}

/// The controller side goal state shim
#[derive(Default)]
pub struct DpShim {
    /// The cache plus dirty state under one mutex
    state: Mutex<ShimState>,
    /// The outbound channels of every connected daemon
    clients: Mutex<Vec<mpsc::Sender<Events>>>,
}

impl DpShim {
    /// Create an empty shim
    pub fn new() -> Self {
        DpShim::default()
    }

    /// Seed the implicit sets the way a node bootup would
    pub async fn bootup(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.ipsets.create_ipset(&IpSetMetadata::empty_hash_set());
        state.ipsets.add_to_lists(
            &[IpSetMetadata::all_namespaces()],
            &[IpSetMetadata::empty_hash_set()],
        )?;
        Ok(())
    }

    /// Register a daemon and hydrate it with the full cache
    ///
    /// # Arguments
    ///
    /// * `client` - The channel events for this daemon go out on
    pub async fn register_client(&self, client: mpsc::Sender<Events>) -> Result<(), Error> {
        let snapshot = self.snapshot().await?;
        client.send(snapshot).await?;
        self.clients.lock().await.push(client);
        Ok(())
    }

    /// Re-hydrate every connected daemon from the full cache
    pub async fn hydrate_clients(&self) -> Result<(), Error> {
        let snapshot = self.snapshot().await?;
        self.broadcast(snapshot).await;
        Ok(())
    }

    /// Build a hydration event carrying the entire cache
    async fn snapshot(&self) -> Result<Events, Error> {
        let state = self.state.lock().await;
        let mut events = Events::new(EventType::Hydration);
        let sets: Vec<IpSetSnapshot> = state
            .ipsets
            .set_names()
            .iter()
            .filter_map(|name| state.ipsets.get(name))
            .map(|set| set.snapshot())
            .collect();
        events.insert(SET_APPLY, &sets)?;
        let policies: Vec<NpmNetworkPolicy> = state
            .policies
            .keys()
            .iter()
            .filter_map(|key| state.policies.get(key))
            .cloned()
            .collect();
        events.insert(POLICY_APPLY, &policies)?;
        Ok(events)
    }

    /// Send an event to every connected daemon, dropping dead channels
    ///
    /// # Arguments
    ///
    /// * `events` - The event to fan out
    async fn broadcast(&self, events: Events) {
        let mut clients = self.clients.lock().await;
        let mut living = Vec::with_capacity(clients.len());
        for client in clients.drain(..) {
            if client.send(events.clone()).await.is_ok() {
                living.push(client);
            } else {
                event!(Level::INFO, "dropped a disconnected goal state client");
            }
        }
        *clients = living;
    }

    /// How many daemons are currently connected
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

#[async_trait]
impl Dataplane for DpShim {
    async fn create_ipsets(&self, sets: &[IpSetMetadata]) -> Result<(), Error> {
        self.state.lock().await.ipsets.create_ipsets(sets);
        Ok(())
    }

    async fn delete_ipset(&self, set: &IpSetMetadata, option: DeleteOption) -> Result<(), Error> {
        self.state
            .lock()
            .await
            .ipsets
            .delete_ipset(&set.prefixed_name(), option);
        Ok(())
    }

    async fn add_to_sets(&self, sets: &[IpSetMetadata], pod: &PodMetadata) -> Result<(), Error> {
        self.state.lock().await.ipsets.add_to_sets(sets, pod)
    }

    async fn remove_from_sets(
        &self,
        sets: &[IpSetMetadata],
        pod: &PodMetadata,
    ) -> Result<(), Error> {
        self.state.lock().await.ipsets.remove_from_sets(sets, pod)
    }

    async fn add_to_lists(
        &self,
        lists: &[IpSetMetadata],
        members: &[IpSetMetadata],
    ) -> Result<(), Error> {
        self.state.lock().await.ipsets.add_to_lists(lists, members)
    }

    async fn remove_from_lists(
        &self,
        lists: &[IpSetMetadata],
        members: &[IpSetMetadata],
    ) -> Result<(), Error> {
        self.state
            .lock()
            .await
            .ipsets
            .remove_from_lists(lists, members)
    }

    async fn update_pod(&self, _update: &PodUpdate) -> Result<(), Error> {
        // endpoints live on the node side only
        Ok(())
    }

    async fn add_policy(&self, policy: NpmNetworkPolicy) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let key = policy.key();
        for translated in policy
            .pod_selector_ipsets
            .iter()
            .chain(policy.rule_ipsets.iter())
        {
            state.ipsets.populate_translated(translated)?;
        }
        for meta in policy.selector_metadata() {
            state
                .ipsets
                .add_reference(&meta.prefixed_name(), &key, ReferenceKind::Selector)?;
        }
        for meta in policy.rule_metadata() {
            state
                .ipsets
                .add_reference(&meta.prefixed_name(), &key, ReferenceKind::NetPol)?;
        }
        let previous = state.policies.get(&key).cloned();
        let stamped = state.policies.stamp(policy);
        // an in-place retranslation may have dropped sets the old policy
        // referenced, and those holds must go the same way remove_policy
        // releases them
        if let Some(previous) = previous {
            let fresh_names: HashSet<String> = stamped
                .selector_metadata()
                .into_iter()
                .chain(stamped.rule_metadata())
                .map(|meta| meta.prefixed_name())
                .collect();
            for meta in previous.selector_metadata() {
                let name = meta.prefixed_name();
                if !fresh_names.contains(&name) {
                    state
                        .ipsets
                        .delete_reference(&name, &key, ReferenceKind::Selector);
                    shim_trim(&mut state.ipsets, meta);
                }
            }
            for meta in previous.rule_metadata() {
                let name = meta.prefixed_name();
                if !fresh_names.contains(&name) {
                    state
                        .ipsets
                        .delete_reference(&name, &key, ReferenceKind::NetPol);
                    shim_trim(&mut state.ipsets, meta);
                }
            }
        }
        state.deleted_policies.retain(|dirty| dirty != &key);
        if !state.dirty_policies.contains(&key) {
            state.dirty_policies.push(key);
        }
        Ok(())
    }

    async fn remove_policy(&self, key: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let Some(policy) = state.policies.forget(key) else {
            return Ok(());
        };
        // drop references and trim sets the same way the real dataplane does
        for meta in policy.selector_metadata() {
            let name = meta.prefixed_name();
            state
                .ipsets
                .delete_reference(&name, key, ReferenceKind::Selector);
            shim_trim(&mut state.ipsets, meta);
        }
        for meta in policy.rule_metadata() {
            let name = meta.prefixed_name();
            state
                .ipsets
                .delete_reference(&name, key, ReferenceKind::NetPol);
            shim_trim(&mut state.ipsets, meta);
        }
        state.dirty_policies.retain(|dirty| dirty != key);
        let key = key.to_owned();
        if !state.deleted_policies.contains(&key) {
            state.deleted_policies.push(key);
        }
        Ok(())
    }

    async fn update_policy(&self, policy: NpmNetworkPolicy) -> Result<(), Error> {
        self.add_policy(policy).await
    }

    async fn apply_dataplane(&self) -> Result<(), Error> {
        let mut events = Events::new(EventType::GoalState);
        {
            let mut state = self.state.lock().await;
            let (to_update, to_delete) = state.ipsets.to_apply();
            events.insert(SET_APPLY, &to_update)?;
            events.insert(SET_REMOVE, &to_delete)?;
            let dirty: Vec<NpmNetworkPolicy> = state
                .dirty_policies
                .iter()
                .filter_map(|key| state.policies.get(key))
                .cloned()
                .collect();
            events.insert(POLICY_APPLY, &dirty)?;
            events.insert(POLICY_REMOVE, &state.deleted_policies)?;
            // applying twice with no mutation in between is a no-op
            if events.is_empty() {
                return Ok(());
            }
            state.ipsets.clear_dirty();
            state.dirty_policies.clear();
            state.deleted_policies.clear();
        }
        self.broadcast(events).await;
        Ok(())
    }
}

/// Trim a set a removed policy no longer holds, mirroring the facade
///
/// # Arguments
///
/// * `ipsets` - The shim's set graph
/// * `meta` - The set the removed policy referenced
fn shim_trim(ipsets: &mut IpSetManager, meta: &IpSetMetadata) {
    let name = meta.prefixed_name();
    let policy_owned = matches!(
        meta.set_type,
        SetType::CidrBlocks | SetType::NestedLabelOfPod
    );
    let empty = ipsets.get(&name).is_some_and(|set| set.is_empty());
    if policy_owned || empty {
        ipsets.delete_ipset(&name, DeleteOption::Soft);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden::models::{SetType, TranslatedIpSet};

    /// Drain one event from a client channel
    async fn next_event(rx: &mut mpsc::Receiver<Events>) -> Events {
        tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn registration_hydrates_the_client() {
        let shim = DpShim::new();
        shim.bootup().await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        shim.register_client(tx).await.unwrap();
        let hydration = next_event(&mut rx).await;
        assert_eq!(hydration.event_type, EventType::Hydration);
        let sets: Vec<IpSetSnapshot> = hydration.payloads[SET_APPLY].decode().unwrap();
        let names: Vec<String> = sets
            .iter()
            .map(|set| set.metadata.as_ref().unwrap().prefixed_name())
            .collect();
        assert!(names.contains(&"emptyhashset".to_owned()));
        assert!(names.contains(&"all-namespaces".to_owned()));
    }

    #[tokio::test]
    async fn applies_stream_only_the_delta() {
        let shim = DpShim::new();
        shim.bootup().await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        shim.register_client(tx).await.unwrap();
        // swallow the hydration event
        next_event(&mut rx).await;
        // flush the bootup dirt
        shim.apply_dataplane().await.unwrap();
        next_event(&mut rx).await;
        // now a pod membership lands
        let ns = IpSetMetadata::new("x", SetType::Namespace);
        shim.add_to_sets(
            std::slice::from_ref(&ns),
            &PodMetadata::new("10.0.0.1", "x/a", "node-1"),
        )
        .await
        .unwrap();
        shim.apply_dataplane().await.unwrap();
        let delta = next_event(&mut rx).await;
        assert_eq!(delta.event_type, EventType::GoalState);
        let sets: Vec<IpSetSnapshot> = delta.payloads[SET_APPLY].decode().unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].metadata.as_ref().unwrap().prefixed_name(), "ns-x");
        assert_eq!(sets[0].members[0].ip, "10.0.0.1");
        // a second apply with no mutation sends nothing
        shim.apply_dataplane().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn retranslated_policies_release_their_old_sets() {
        let shim = DpShim::new();
        shim.bootup().await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        shim.register_client(tx).await.unwrap();
        next_event(&mut rx).await;
        let selecting = |selector: &str| NpmNetworkPolicy {
            namespace: "x".to_owned(),
            name: "base".to_owned(),
            pod_selector_ipsets: vec![TranslatedIpSet::new(IpSetMetadata::new(
                selector,
                SetType::KeyValueLabelOfPod,
            ))],
            ..NpmNetworkPolicy::default()
        };
        shim.add_policy(selecting("k1:v1")).await.unwrap();
        shim.apply_dataplane().await.unwrap();
        next_event(&mut rx).await;
        // the same policy comes back retranslated with a different selector
        shim.add_policy(selecting("k2:v2")).await.unwrap();
        shim.apply_dataplane().await.unwrap();
        let delta = next_event(&mut rx).await;
        // the delta removes the old selector set and installs the new one
        let gone: Vec<String> = delta.payloads[SET_REMOVE].decode().unwrap();
        assert!(gone.contains(&"podlabel-k1:v1".to_owned()));
        let fresh: Vec<IpSetSnapshot> = delta.payloads[SET_APPLY].decode().unwrap();
        assert!(fresh.iter().any(|set| {
            set.metadata.as_ref().unwrap().prefixed_name() == "podlabel-k2:v2"
        }));
        // the stream carries the bumped revision too
        let policies: Vec<NpmNetworkPolicy> = delta.payloads[POLICY_APPLY].decode().unwrap();
        assert_eq!((policies[0].generation, policies[0].revision), (1, 2));
    }

    #[tokio::test]
    async fn policy_lifecycle_streams_installs_and_removals() {
        let shim = DpShim::new();
        shim.bootup().await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        shim.register_client(tx).await.unwrap();
        next_event(&mut rx).await;
        let policy = NpmNetworkPolicy {
            namespace: "x".to_owned(),
            name: "base".to_owned(),
            pod_selector_ipsets: vec![TranslatedIpSet::new(IpSetMetadata::new(
                "k1:v1",
                SetType::KeyValueLabelOfPod,
            ))],
            ..NpmNetworkPolicy::default()
        };
        shim.add_policy(policy).await.unwrap();
        shim.apply_dataplane().await.unwrap();
        let delta = next_event(&mut rx).await;
        let policies: Vec<NpmNetworkPolicy> = delta.payloads[POLICY_APPLY].decode().unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].key(), "x/base");
        assert_eq!(policies[0].generation, 1);
        // removal streams the key and trims the selector set
        shim.remove_policy("x/base").await.unwrap();
        shim.apply_dataplane().await.unwrap();
        let delta = next_event(&mut rx).await;
        let removed: Vec<String> = delta.payloads[POLICY_REMOVE].decode().unwrap();
        assert_eq!(removed, vec!["x/base"]);
        let gone: Vec<String> = delta.payloads[SET_REMOVE].decode().unwrap();
        assert!(gone.contains(&"podlabel-k1:v1".to_owned()));
    }
}
