//! The dataplane facade and the trait controllers program it through
//!
//! Every mutation only touches the in-memory graph and dirty cache; the
//! platform sees nothing until `apply_dataplane` flushes. The same trait is
//! implemented by the controller side goal state shim, so controllers never
//! know whether they are programming this node or a remote one.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{Level, event};

use warden::Error;
use warden::conf::{LinuxConf, WindowsConf};
use warden::models::{
    DeleteOption, IpSetMetadata, NpmNetworkPolicy, PodMetadata, ReferenceKind, SetType,
};

use crate::endpoints::{Claim, EndpointCache};
use crate::hns::{Hns, HnsNetwork, PolicyOp, SetPolicySetting};
use crate::ipsets::{self, IpSetManager};
use crate::policies::{self, PolicyManager};
use crate::restore::CommandRunner;

/// A pod event handed to the dataplane by the pod controller
#[derive(Debug, Default)]
pub struct PodUpdate {
    /// The namespace/name key of the pod
    pub pod_key: String,
    /// The IP assigned to the pod
    pub pod_ip: String,
    /// The node the pod runs on
    pub node_name: String,
    /// The sets the pod just joined
    pub ipsets_to_add: Vec<IpSetMetadata>,
    /// The sets the pod just left
    pub ipsets_to_remove: Vec<IpSetMetadata>,
    /// Whether the pod is going away
    pub marked_for_delete: bool,
}

/// The operations controllers drive the dataplane through
#[async_trait]
pub trait Dataplane: Send + Sync {
    /// Create sets in the in-memory graph
    ///
    /// # Arguments
    ///
    /// * `sets` - The sets to create
    async fn create_ipsets(&self, sets: &[IpSetMetadata]) -> Result<(), Error>;

    /// Delete a set from the in-memory graph
    ///
    /// # Arguments
    ///
    /// * `set` - The set to delete
    /// * `option` - Whether live references block the delete
    async fn delete_ipset(&self, set: &IpSetMetadata, option: DeleteOption) -> Result<(), Error>;

    /// Add a pod member to several hash sets
    ///
    /// # Arguments
    ///
    /// * `sets` - The hash sets to add the member to
    /// * `pod` - The member to add
    async fn add_to_sets(&self, sets: &[IpSetMetadata], pod: &PodMetadata) -> Result<(), Error>;

    /// Remove a pod member from several hash sets
    ///
    /// # Arguments
    ///
    /// * `sets` - The hash sets to remove the member from
    /// * `pod` - The member to remove
    async fn remove_from_sets(&self, sets: &[IpSetMetadata], pod: &PodMetadata)
    -> Result<(), Error>;

    /// Add member sets to several lists
    ///
    /// # Arguments
    ///
    /// * `lists` - The lists to extend
    /// * `members` - The sets to add to each list
    async fn add_to_lists(
        &self,
        lists: &[IpSetMetadata],
        members: &[IpSetMetadata],
    ) -> Result<(), Error>;

    /// Remove member sets from several lists
    ///
    /// # Arguments
    ///
    /// * `lists` - The lists to shrink
    /// * `members` - The sets to remove from each list
    async fn remove_from_lists(
        &self,
        lists: &[IpSetMetadata],
        members: &[IpSetMetadata],
    ) -> Result<(), Error>;

    /// React to a pod landing on or leaving this node's endpoints
    ///
    /// Only the Windows backend has endpoints; everywhere else this is a
    /// no-op.
    ///
    /// # Arguments
    ///
    /// * `update` - The pod event to react to
    async fn update_pod(&self, update: &PodUpdate) -> Result<(), Error>;

    /// Install a translated policy
    ///
    /// # Arguments
    ///
    /// * `policy` - The policy to install
    async fn add_policy(&self, policy: NpmNetworkPolicy) -> Result<(), Error>;

    /// Remove an installed policy
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the policy
    async fn remove_policy(&self, key: &str) -> Result<(), Error>;

    /// Replace an installed policy with a fresh translation
    ///
    /// # Arguments
    ///
    /// * `policy` - The fresh policy
    async fn update_policy(&self, policy: NpmNetworkPolicy) -> Result<(), Error>;

    /// Flush all dirty state to the platform
    async fn apply_dataplane(&self) -> Result<(), Error>;
}

/// The platform a dataplane programs
pub enum Backend {
    /// ipset and iptables-restore through a command runner
    Linux {
        /// The runner executing ipset and iptables
        runner: Box<dyn CommandRunner>,
        /// The Linux dataplane config
        conf: LinuxConf,
        /// Emptied policy sub-chains awaiting destruction
        stale_chains: Mutex<HashSet<String>>,
    },
    /// SetPolicies and endpoint ACLs through HNS
    Windows {
        /// The HNS client to program through
        hns: Box<dyn Hns>,
        /// The network this node programs
        network: HnsNetwork,
        /// The Windows dataplane config
        conf: WindowsConf,
        /// The pod IP to endpoint cache
        endpoints: Mutex<EndpointCache>,
    },
}

impl Backend {
    /// Create a Linux backend
    ///
    /// # Arguments
    ///
    /// * `runner` - The runner executing ipset and iptables
    /// * `conf` - The Linux dataplane config
    pub fn linux(runner: Box<dyn CommandRunner>, conf: LinuxConf) -> Self {
        Backend::Linux {
            runner,
            conf,
            stale_chains: Mutex::default(),
        }
    }

    /// Create a Windows backend
    ///
    /// # Arguments
    ///
    /// * `hns` - The HNS client to program through
    /// * `network` - The network this node programs
    /// * `conf` - The Windows dataplane config
    pub fn windows(hns: Box<dyn Hns>, network: HnsNetwork, conf: WindowsConf) -> Self {
        let endpoints = Mutex::new(EndpointCache::new(conf.stale_pod_key_minutes));
        Backend::Windows {
            hns,
            network,
            conf,
            endpoints,
        }
    }
}

/// The node local dataplane facade
pub struct DataPlane {
    /// The name of the node this dataplane programs
    node_name: String,
    /// The in-memory IP set graph
    ipsets: Mutex<IpSetManager>,
    /// The translated policy cache
    policies: Mutex<PolicyManager>,
    /// The platform being programmed
    backend: Backend,
}

impl DataPlane {
    /// Create a new dataplane
    ///
    /// # Arguments
    ///
    /// * `node_name` - The name of the node this dataplane programs
    /// * `backend` - The platform to program
    pub fn new<T: Into<String>>(node_name: T, backend: Backend) -> Self {
        DataPlane {
            node_name: node_name.into(),
            ipsets: Mutex::new(IpSetManager::new()),
            policies: Mutex::new(PolicyManager::new()),
            backend,
        }
    }

    /// Get the platform backend
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Lock the IP set graph
    pub async fn ipsets(&self) -> MutexGuard<'_, IpSetManager> {
        self.ipsets.lock().await
    }

    /// Lock the policy cache
    pub async fn policies(&self) -> MutexGuard<'_, PolicyManager> {
        self.policies.lock().await
    }

    /// Install base state and clean up anything a dead run left behind
    pub async fn bootup(&self) -> Result<(), Error> {
        match &self.backend {
            Backend::Linux { runner, conf, .. } => {
                policies::linux::bootup(runner.as_ref(), conf).await?;
                ipsets::linux::destroy_leftovers(runner.as_ref(), conf).await?;
            }
            Backend::Windows {
                hns,
                network,
                conf,
                endpoints,
            } => {
                // a wrong policy mode is fatal at startup
                hns.set_policy_supported(&network.id, conf.policy_mode)
                    .await?;
                // discover the endpoints that already exist and strip our ACLs
                let fresh = hns.list_endpoints_of_network(&network.id).await?;
                let ids: Vec<String> = fresh
                    .iter()
                    .filter(|endpoint| !endpoint.is_remote)
                    .map(|endpoint| endpoint.id.clone())
                    .collect();
                endpoints.lock().await.refresh(fresh, Utc::now());
                for id in &ids {
                    policies::windows::reset_endpoint(hns.as_ref(), id).await?;
                }
                // drop set policies a dead run left on the network
                let leftovers: Vec<SetPolicySetting> = hns
                    .get_network_policies(&network.id)
                    .await?
                    .into_iter()
                    .filter(|set| set.id.starts_with("azure-npm-"))
                    .collect();
                if !leftovers.is_empty() {
                    hns.apply_network_policies(&network.id, PolicyOp::Remove, leftovers)
                        .await?;
                }
            }
        }
        // the implicit sets exist on every platform
        let mut ipsets = self.ipsets.lock().await;
        ipsets.create_ipset(&IpSetMetadata::empty_hash_set());
        ipsets.add_to_lists(
            &[IpSetMetadata::all_namespaces()],
            &[IpSetMetadata::empty_hash_set()],
        )?;
        self.apply_ipsets(&mut ipsets).await?;
        event!(Level::INFO, node = %self.node_name, "dataplane booted");
        Ok(())
    }

    /// Flush the dirty set state while already holding the graph lock
    ///
    /// # Arguments
    ///
    /// * `ipsets` - The locked IP set graph
    async fn apply_ipsets(&self, ipsets: &mut IpSetManager) -> Result<(), Error> {
        // applying with nothing dirty is a no-op
        if ipsets.dirty().to_add_or_update_sets.is_empty()
            && ipsets.dirty().to_delete_sets.is_empty()
        {
            return Ok(());
        }
        let (to_update, to_delete) = ipsets.to_apply();
        match &self.backend {
            Backend::Linux { runner, conf, .. } => {
                let deferred =
                    ipsets::linux::apply(runner.as_ref(), conf, &to_update, &to_delete).await?;
                ipsets.clear_dirty();
                // destroys the kernel refused stay dirty for the next apply
                for name in deferred {
                    ipsets.remark_deleted(&name);
                }
            }
            Backend::Windows { hns, network, .. } => {
                ipsets::windows::apply(hns.as_ref(), &network.id, &to_update, &to_delete).await?;
                ipsets.clear_dirty();
            }
        }
        Ok(())
    }

    /// Refresh the endpoint cache from HNS
    ///
    /// This is the debug escape hatch as well as the pre-policy refresh; on
    /// Linux it is a no-op.
    pub async fn refresh_endpoints(&self) -> Result<(), Error> {
        if let Backend::Windows {
            hns,
            network,
            endpoints,
            ..
        } = &self.backend
        {
            let fresh = hns.list_endpoints_of_network(&network.id).await?;
            endpoints.lock().await.refresh(fresh, Utc::now());
        }
        Ok(())
    }

    /// Run one background reconcile pass
    ///
    /// Garbage collects unreferenced empty label sets, retries anything the
    /// last apply left dirty, and destroys emptied policy sub-chains.
    pub async fn reconcile(&self) -> Result<(), Error> {
        {
            let mut ipsets = self.ipsets.lock().await;
            let collected = ipsets.garbage_collect();
            if collected > 0 {
                event!(Level::INFO, collected, "garbage collected unused sets");
            }
            self.apply_ipsets(&mut ipsets).await?;
        }
        if let Backend::Linux {
            runner,
            conf,
            stale_chains,
        } = &self.backend
        {
            // destroy sub-chains emptied by earlier policy removals
            let doomed: Vec<String> = stale_chains.lock().await.drain().collect();
            if let Err(error) =
                policies::linux::destroy_chains(runner.as_ref(), conf, &doomed).await
            {
                // put them back so the next pass retries
                stale_chains.lock().await.extend(doomed);
                return Err(error);
            }
        }
        Ok(())
    }

    /// Decide which sets a removed policy leaves eligible for deletion
    ///
    /// Policy owned set types go as soon as nothing references them; shared
    /// label sets only go once they are also empty.
    ///
    /// # Arguments
    ///
    /// * `ipsets` - The locked IP set graph
    /// * `meta` - The set the removed policy referenced
    fn trim_set(ipsets: &mut IpSetManager, meta: &IpSetMetadata) {
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
}

#[async_trait]
impl Dataplane for DataPlane {
    async fn create_ipsets(&self, sets: &[IpSetMetadata]) -> Result<(), Error> {
        self.ipsets.lock().await.create_ipsets(sets);
        Ok(())
    }

    async fn delete_ipset(&self, set: &IpSetMetadata, option: DeleteOption) -> Result<(), Error> {
        self.ipsets
            .lock()
            .await
            .delete_ipset(&set.prefixed_name(), option);
        Ok(())
    }

    async fn add_to_sets(&self, sets: &[IpSetMetadata], pod: &PodMetadata) -> Result<(), Error> {
        self.ipsets.lock().await.add_to_sets(sets, pod)
    }

    async fn remove_from_sets(
        &self,
        sets: &[IpSetMetadata],
        pod: &PodMetadata,
    ) -> Result<(), Error> {
        self.ipsets.lock().await.remove_from_sets(sets, pod)
    }

    async fn add_to_lists(
        &self,
        lists: &[IpSetMetadata],
        members: &[IpSetMetadata],
    ) -> Result<(), Error> {
        self.ipsets.lock().await.add_to_lists(lists, members)
    }

    async fn remove_from_lists(
        &self,
        lists: &[IpSetMetadata],
        members: &[IpSetMetadata],
    ) -> Result<(), Error> {
        self.ipsets.lock().await.remove_from_lists(lists, members)
    }

    async fn update_pod(&self, update: &PodUpdate) -> Result<(), Error> {
        let Backend::Windows { hns, endpoints, .. } = &self.backend else {
            // no endpoint cache outside windows
            return Ok(());
        };
        // pods on other nodes only matter when they are going away
        if update.node_name != self.node_name && !update.marked_for_delete {
            return Ok(());
        }
        let mut cache = endpoints.lock().await;
        if update.marked_for_delete {
            // the departing pod becomes the endpoint's stale key, but its
            // installed policies still come off below
            cache.release(&update.pod_ip, &update.pod_key, Utc::now());
        } else {
            match cache.claim(&update.pod_ip, &update.pod_key)? {
                // no endpoint yet or the ip has moved on, nothing to program
                Claim::Missing | Claim::Reassigned => return Ok(()),
                Claim::Claimed => (),
            }
        }
        let Some(endpoint) = cache.get(&update.pod_ip) else {
            return Ok(());
        };
        let endpoint_id = endpoint.id.clone();
        let mut policies_mgr = self.policies.lock().await;
        // removed sets may take installed policies off this endpoint
        for meta in &update.ipsets_to_remove {
            let candidates: Vec<NpmNetworkPolicy> = policies_mgr
                .policies_selecting(&meta.prefixed_name())
                .into_iter()
                .cloned()
                .collect();
            for policy in candidates {
                let key = policy.key();
                let endpoint = cache.get_mut(&update.pod_ip).unwrap();
                if endpoint.netpol_references.remove(&key) {
                    policies::windows::remove_from_endpoint(
                        hns.as_ref(),
                        &endpoint_id,
                        &policy.acl_id(),
                    )
                    .await?;
                    policies_mgr.remove_endpoint(&key, &update.pod_ip);
                }
            }
        }
        // a dying pod never picks up new policies
        if update.marked_for_delete {
            return Ok(());
        }
        // added sets may make policies newly applicable here
        let ipsets = self.ipsets.lock().await;
        for meta in &update.ipsets_to_add {
            let candidates: Vec<NpmNetworkPolicy> = policies_mgr
                .policies_selecting(&meta.prefixed_name())
                .into_iter()
                .cloned()
                .collect();
            for policy in candidates {
                let selector_names: Vec<String> = policy
                    .selector_metadata()
                    .iter()
                    .map(|meta| meta.prefixed_name())
                    .collect();
                // the pod must sit in every selector set, not just this one
                if !ipsets.ip_satisfies_all(&selector_names, &update.pod_ip) {
                    continue;
                }
                let key = policy.key();
                let endpoint = cache.get_mut(&update.pod_ip).unwrap();
                if endpoint.netpol_references.insert(key.clone()) {
                    policies::windows::install_on_endpoint(hns.as_ref(), &endpoint_id, &policy)
                        .await?;
                    policies_mgr.add_endpoint(&key, &update.pod_ip, &endpoint_id);
                }
            }
        }
        Ok(())
    }

    async fn add_policy(&self, policy: NpmNetworkPolicy) -> Result<(), Error> {
        let key = policy.key();
        {
            let mut ipsets = self.ipsets.lock().await;
            // materialize every set the policy needs
            for translated in policy
                .pod_selector_ipsets
                .iter()
                .chain(policy.rule_ipsets.iter())
            {
                ipsets.populate_translated(translated)?;
            }
            for meta in policy.selector_metadata() {
                ipsets.add_reference(&meta.prefixed_name(), &key, ReferenceKind::Selector)?;
            }
            for meta in policy.rule_metadata() {
                ipsets.add_reference(&meta.prefixed_name(), &key, ReferenceKind::NetPol)?;
            }
            // the platform must see the sets before rules reference them
            self.apply_ipsets(&mut ipsets).await?;
        }
        let mut policy = policy;
        if let Backend::Windows { endpoints, .. } = &self.backend {
            // refresh so freshly created endpoints are visible to resolution
            self.refresh_endpoints().await?;
            let ipsets = self.ipsets.lock().await;
            let selector_names: Vec<String> = policy
                .selector_metadata()
                .iter()
                .map(|meta| meta.prefixed_name())
                .collect();
            let ips = ipsets.ips_satisfying_all(&selector_names);
            drop(ipsets);
            let mut cache = endpoints.lock().await;
            let resolved = cache.resolve(&ips);
            // remember which endpoints carry this policy
            for ip in resolved.keys() {
                if let Some(endpoint) = cache.get_mut(ip) {
                    endpoint.netpol_references.insert(key.clone());
                }
            }
            policy.pod_endpoints = resolved;
        }
        let mut policies_mgr = self.policies.lock().await;
        let previous = policies_mgr.get(&key).cloned();
        let stamped = policies_mgr.stamp(policy);
        drop(policies_mgr);
        match &self.backend {
            Backend::Linux {
                runner,
                conf,
                stale_chains,
            } => {
                // an update tears the old rules down first so the platform
                // only ever sees a consistent snapshot
                if let Some(previous) = &previous {
                    let chain = policies::linux::remove(runner.as_ref(), conf, previous).await?;
                    stale_chains.lock().await.insert(chain);
                }
                policies::linux::install(runner.as_ref(), conf, &stamped).await?;
            }
            Backend::Windows { hns, endpoints, .. } => {
                if let Some(previous) = &previous {
                    policies::windows::remove(hns.as_ref(), previous).await?;
                    // endpoints the retranslation no longer covers drop
                    // their hold on the policy
                    let mut cache = endpoints.lock().await;
                    for ip in previous.pod_endpoints.keys() {
                        if !stamped.pod_endpoints.contains_key(ip) {
                            if let Some(endpoint) = cache.get_mut(ip) {
                                endpoint.netpol_references.remove(&key);
                            }
                        }
                    }
                }
                policies::windows::install(hns.as_ref(), &stamped).await?;
            }
        }
        // an in-place retranslation may have dropped sets the old policy
        // referenced, and those holds must go the same way RemovePolicy
        // releases them
        if let Some(previous) = previous {
            let fresh_names: HashSet<String> = stamped
                .selector_metadata()
                .into_iter()
                .chain(stamped.rule_metadata())
                .map(IpSetMetadata::prefixed_name)
                .collect();
            let mut ipsets = self.ipsets.lock().await;
            for meta in previous.selector_metadata() {
                let name = meta.prefixed_name();
                if !fresh_names.contains(&name) {
                    ipsets.delete_reference(&name, &key, ReferenceKind::Selector);
                    DataPlane::trim_set(&mut ipsets, meta);
                }
            }
            for meta in previous.rule_metadata() {
                let name = meta.prefixed_name();
                if !fresh_names.contains(&name) {
                    ipsets.delete_reference(&name, &key, ReferenceKind::NetPol);
                    DataPlane::trim_set(&mut ipsets, meta);
                }
            }
            self.apply_ipsets(&mut ipsets).await?;
        }
        Ok(())
    }

    async fn remove_policy(&self, key: &str) -> Result<(), Error> {
        let Some(policy) = self.policies.lock().await.forget(key) else {
            return Ok(());
        };
        match &self.backend {
            Backend::Linux {
                runner,
                conf,
                stale_chains,
            } => {
                let chain = policies::linux::remove(runner.as_ref(), conf, &policy).await?;
                // the emptied chain is destroyed by the background reconcile
                stale_chains.lock().await.insert(chain);
            }
            Backend::Windows { hns, endpoints, .. } => {
                policies::windows::remove(hns.as_ref(), &policy).await?;
                endpoints.lock().await.drop_policy(key);
            }
        }
        // walk the references backwards and trim sets nothing needs anymore
        let mut ipsets = self.ipsets.lock().await;
        for meta in policy.selector_metadata() {
            ipsets.delete_reference(&meta.prefixed_name(), key, ReferenceKind::Selector);
            DataPlane::trim_set(&mut ipsets, meta);
        }
        for meta in policy.rule_metadata() {
            ipsets.delete_reference(&meta.prefixed_name(), key, ReferenceKind::NetPol);
            DataPlane::trim_set(&mut ipsets, meta);
        }
        self.apply_ipsets(&mut ipsets).await?;
        Ok(())
    }

    async fn update_policy(&self, policy: NpmNetworkPolicy) -> Result<(), Error> {
        // the add path already tears down and reinstalls existing policies
        self.add_policy(policy).await
    }

    async fn apply_dataplane(&self) -> Result<(), Error> {
        let mut ipsets = self.ipsets.lock().await;
        self.apply_ipsets(&mut ipsets).await
    }
}
