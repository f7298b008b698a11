//! The pod reconciler
//!
//! Keeps every tracked pod's IP in its namespace set, one set per label key
//! and pair, and one member per named container port. Host network pods and
//! pods without a usable IPv4 are ignored; everything else is diffed against
//! the shared cache so only real changes reach the dataplane.

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::reflector::{self, reflector, ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{Level, event};

use warden::Error;
use warden::conf::ControllerConf;
use warden::models::{IpSetMetadata, NamedPort, NpmPod, PodMetadata, SetType};
use warden_dataplane::{Dataplane, PodUpdate};

use super::super::cache::SharedCache;
use super::super::queue::WorkQueue;
use super::{combine, object_key};

/// The pod reconciler
pub struct PodController {
    /// The dataplane being programmed
    dataplane: Arc<dyn Dataplane>,
    /// The cache shared with the namespace controller
    cache: Arc<Mutex<SharedCache>>,
    /// The queue feeding the worker
    queue: Arc<WorkQueue>,
    /// The lister backing sync lookups
    store: Store<Pod>,
}

impl PodController {
    /// Watch pods and reconcile them until the stop channel flips
    ///
    /// # Arguments
    ///
    /// * `client` - The k8s client to watch through
    /// * `dataplane` - The dataplane being programmed
    /// * `cache` - The cache shared with the namespace controller
    /// * `conf` - The controller config
    /// * `stop` - The channel the caller shuts us down through
    pub async fn start(
        client: kube::Client,
        dataplane: Arc<dyn Dataplane>,
        cache: Arc<Mutex<SharedCache>>,
        conf: ControllerConf,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::all(client);
        let (store, writer) = reflector::store();
        let queue = WorkQueue::new(
            Duration::from_millis(conf.requeue_base_ms),
            Duration::from_secs(conf.requeue_max_secs),
        );
        let controller = Arc::new(PodController {
            dataplane,
            cache,
            queue: queue.clone(),
            store,
        });
        // one worker loop per controller
        let worker = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.worker().await })
        };
        // feed the queue from the watch
        let stream = watcher(api, watcher::Config::default()).default_backoff();
        let mut stream = reflector(writer, stream).touched_objects().boxed();
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                next = stream.try_next() => {
                    match next {
                        Ok(Some(pod)) => {
                            if let Some(key) = object_key(&pod) {
                                controller.queue.add(&key);
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            event!(Level::WARN, error = %error, "pod watch hiccup");
                        }
                    }
                }
            }
        }
        queue.shutdown();
        worker.await??;
        Ok(())
    }

    /// Pull keys and sync them until the queue drains
    async fn worker(self: Arc<Self>) -> Result<(), Error> {
        while let Some(key) = self.queue.get().await {
            match self.sync(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(error) if error.is_permanent() => {
                    event!(Level::WARN, pod = %key, error = %error, "dropping pod after a permanent error");
                    self.queue.forget(&key);
                }
                Err(error) => {
                    event!(
                        Level::WARN,
                        pod = %key,
                        error = %error,
                        failures = self.queue.failures(&key),
                        "pod sync failed, requeueing"
                    );
                    self.queue.add_rate_limited(&key);
                }
            }
            self.queue.done(&key);
        }
        Ok(())
    }

    /// Sync one pod under the shared cache lock, always flushing after
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the pod
    async fn sync(&self, key: &str) -> Result<(), Error> {
        let mut shared = self.cache.lock().await;
        let result = self.sync_pod(&mut shared, key).await;
        // flush whatever progress we made even on an early error
        let applied = self.dataplane.apply_dataplane().await;
        drop(shared);
        combine(result, applied)
    }

    /// Reconcile one pod against the cache
    ///
    /// # Arguments
    ///
    /// * `shared` - The locked shared cache
    /// * `key` - The namespace/name key of the pod
    async fn sync_pod(&self, shared: &mut SharedCache, key: &str) -> Result<(), Error> {
        let Some((namespace, name)) = key.split_once('/') else {
            return Err(Error::validation(format!("{key} is not a pod key")));
        };
        let fetched = self
            .store
            .get(&ObjectRef::new(name).within(namespace));
        let Some(pod) = fetched else {
            // gone from the lister means the pod was deleted
            return self.delete_pod(shared, key).await;
        };
        // host network pods share the node ip and are never tracked
        if pod
            .spec
            .as_ref()
            .and_then(|spec| spec.host_network)
            .unwrap_or_default()
        {
            return Ok(());
        }
        let fresh = as_npm_pod(&pod);
        let evicted = pod.metadata.deletion_timestamp.is_some()
            && pod.metadata.deletion_grace_period_seconds == Some(0);
        if fresh.is_completed() || evicted {
            return self.delete_pod(shared, key).await;
        }
        // pods without a usable ipv4 wait for their next event
        if fresh.pod_ip.is_empty() || fresh.metadata().validate_ipv4().is_err() {
            if shared.pods.contains_key(key) {
                return self.delete_pod(shared, key).await;
            }
            return Ok(());
        }
        match shared.pods.get(key) {
            None => self.create_pod(shared, fresh).await,
            Some(cached) if cached.no_update(&fresh) && pod.metadata.deletion_timestamp.is_none() => {
                Ok(())
            }
            Some(cached) => {
                let cached = cached.clone();
                self.change_pod(shared, cached, fresh).await
            }
        }
    }

    /// Put a fresh pod into its sets and claim its endpoint
    ///
    /// # Arguments
    ///
    /// * `shared` - The locked shared cache
    /// * `fresh` - The pod to track
    async fn create_pod(&self, shared: &mut SharedCache, fresh: NpmPod) -> Result<(), Error> {
        // the pod's namespace set must exist and sit in all-namespaces even
        // when the namespace controller has not seen the namespace yet
        let ns_set = IpSetMetadata::new(&fresh.namespace, SetType::Namespace);
        self.dataplane
            .create_ipsets(std::slice::from_ref(&ns_set))
            .await?;
        self.dataplane
            .add_to_lists(&[IpSetMetadata::all_namespaces()], &[ns_set])
            .await?;
        let sets = pod_sets(&fresh);
        let member = fresh.metadata();
        self.dataplane.add_to_sets(&sets, &member).await?;
        let mut all_sets = sets;
        for (set, port_member) in named_port_sets(&fresh) {
            self.dataplane
                .add_to_sets(std::slice::from_ref(&set), &port_member)
                .await?;
            all_sets.push(set);
        }
        self.dataplane
            .update_pod(&PodUpdate {
                pod_key: fresh.key(),
                pod_ip: fresh.pod_ip.clone(),
                node_name: fresh.node_name.clone(),
                ipsets_to_add: all_sets,
                ipsets_to_remove: Vec::default(),
                marked_for_delete: false,
            })
            .await?;
        event!(Level::INFO, pod = %fresh.key(), ip = %fresh.pod_ip, "tracking pod");
        shared.pods.insert(fresh.key(), fresh);
        Ok(())
    }

    /// Reconcile a changed pod against its cached state
    ///
    /// # Arguments
    ///
    /// * `shared` - The locked shared cache
    /// * `cached` - The pod as we knew it
    /// * `fresh` - The pod as the event describes it
    async fn change_pod(
        &self,
        shared: &mut SharedCache,
        cached: NpmPod,
        fresh: NpmPod,
    ) -> Result<(), Error> {
        // an ip change is a teardown plus a rebuild
        if cached.pod_ip != fresh.pod_ip {
            self.remove_pod_state(&cached).await?;
            shared.pods.remove(&cached.key());
            return self.create_pod(shared, fresh).await;
        }
        let (removed, added) = cached.label_diff(&fresh.labels);
        let to_remove = label_sets(&removed);
        let to_add = label_sets(&added);
        let member = cached.metadata();
        if !to_remove.is_empty() {
            self.dataplane.remove_from_sets(&to_remove, &member).await?;
        }
        if !to_add.is_empty() {
            self.dataplane.add_to_sets(&to_add, &fresh.metadata()).await?;
        }
        // named port changes swap the whole port membership
        let mut port_removed = Vec::default();
        let mut port_added = Vec::default();
        if cached.container_ports != fresh.container_ports {
            for (set, port_member) in named_port_sets(&cached) {
                self.dataplane
                    .remove_from_sets(std::slice::from_ref(&set), &port_member)
                    .await?;
                port_removed.push(set);
            }
            for (set, port_member) in named_port_sets(&fresh) {
                self.dataplane
                    .add_to_sets(std::slice::from_ref(&set), &port_member)
                    .await?;
                port_added.push(set);
            }
        }
        let mut ipsets_to_add = to_add;
        ipsets_to_add.extend(port_added);
        let mut ipsets_to_remove = to_remove;
        ipsets_to_remove.extend(port_removed);
        self.dataplane
            .update_pod(&PodUpdate {
                pod_key: fresh.key(),
                pod_ip: fresh.pod_ip.clone(),
                node_name: fresh.node_name.clone(),
                ipsets_to_add,
                ipsets_to_remove,
                marked_for_delete: false,
            })
            .await?;
        shared.pods.insert(fresh.key(), fresh);
        Ok(())
    }

    /// Tear a pod out of every set it was in
    ///
    /// # Arguments
    ///
    /// * `shared` - The locked shared cache
    /// * `key` - The namespace/name key of the pod
    async fn delete_pod(&self, shared: &mut SharedCache, key: &str) -> Result<(), Error> {
        let Some(cached) = shared.pods.remove(key) else {
            return Ok(());
        };
        event!(Level::INFO, pod = %key, "untracking pod");
        self.remove_pod_state(&cached).await
    }

    /// Remove a cached pod's memberships and release its endpoint
    ///
    /// # Arguments
    ///
    /// * `cached` - The pod as we knew it
    async fn remove_pod_state(&self, cached: &NpmPod) -> Result<(), Error> {
        let sets = pod_sets(cached);
        let member = cached.metadata();
        self.dataplane.remove_from_sets(&sets, &member).await?;
        let mut all_sets = sets;
        for (set, port_member) in named_port_sets(cached) {
            self.dataplane
                .remove_from_sets(std::slice::from_ref(&set), &port_member)
                .await?;
            all_sets.push(set);
        }
        self.dataplane
            .update_pod(&PodUpdate {
                pod_key: cached.key(),
                pod_ip: cached.pod_ip.clone(),
                node_name: cached.node_name.clone(),
                ipsets_to_add: Vec::default(),
                ipsets_to_remove: all_sets,
                marked_for_delete: true,
            })
            .await
    }
}

/// The hash sets a pod's ip belongs in
///
/// # Arguments
///
/// * `pod` - The pod to compute sets for
fn pod_sets(pod: &NpmPod) -> Vec<IpSetMetadata> {
    let mut sets = vec![IpSetMetadata::new(&pod.namespace, SetType::Namespace)];
    for (key, value) in &pod.labels {
        sets.push(IpSetMetadata::new(key, SetType::KeyLabelOfPod));
        sets.push(IpSetMetadata::new(
            format!("{key}:{value}"),
            SetType::KeyValueLabelOfPod,
        ));
    }
    sets
}

/// Turn a flat label diff back into set metadata
///
/// # Arguments
///
/// * `labels` - The key and key:value entries from a label diff
fn label_sets(labels: &[String]) -> Vec<IpSetMetadata> {
    labels
        .iter()
        .map(|label| {
            // label keys cannot contain a colon, so a colon marks a pair
            if label.contains(':') {
                IpSetMetadata::new(label, SetType::KeyValueLabelOfPod)
            } else {
                IpSetMetadata::new(label, SetType::KeyLabelOfPod)
            }
        })
        .collect()
}

/// The named port sets a pod feeds and their ip,port members
///
/// # Arguments
///
/// * `pod` - The pod to compute named port members for
fn named_port_sets(pod: &NpmPod) -> Vec<(IpSetMetadata, PodMetadata)> {
    pod.container_ports
        .iter()
        .map(|port| {
            (
                IpSetMetadata::new(&port.name, SetType::NamedPorts),
                PodMetadata::new(
                    format!("{},{}", pod.pod_ip, port.port),
                    pod.key(),
                    &pod.node_name,
                ),
            )
        })
        .collect()
}

/// Convert a watched pod into the state we track
///
/// # Arguments
///
/// * `pod` - The pod from the watch
fn as_npm_pod(pod: &Pod) -> NpmPod {
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();
    let container_ports = spec
        .map(|spec| {
            spec.containers
                .iter()
                .flat_map(|container| container.ports.as_deref().unwrap_or_default())
                .filter_map(|port| {
                    let name = port.name.clone()?;
                    Some(NamedPort {
                        name,
                        port: u16::try_from(port.container_port).unwrap_or_default(),
                        protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_owned()),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    NpmPod {
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        name: pod.metadata.name.clone().unwrap_or_default(),
        pod_ip: status
            .and_then(|status| status.pod_ip.clone())
            .unwrap_or_default(),
        node_name: spec
            .and_then(|spec| spec.node_name.clone())
            .unwrap_or_default(),
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        container_ports,
        phase: status
            .and_then(|status| status.phase.clone())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_sets_cover_namespace_and_labels() {
        let mut pod = NpmPod {
            namespace: "x".to_owned(),
            name: "a".to_owned(),
            pod_ip: "10.0.0.1".to_owned(),
            ..NpmPod::default()
        };
        pod.labels.insert("k1".to_owned(), "v1".to_owned());
        let names: Vec<String> = pod_sets(&pod)
            .iter()
            .map(IpSetMetadata::prefixed_name)
            .collect();
        assert_eq!(names, vec!["ns-x", "podlabel-k1", "podlabel-k1:v1"]);
    }

    #[test]
    fn named_ports_become_ip_port_members() {
        let pod = NpmPod {
            namespace: "x".to_owned(),
            name: "a".to_owned(),
            pod_ip: "10.0.0.1".to_owned(),
            container_ports: vec![NamedPort {
                name: "serve-http".to_owned(),
                port: 8080,
                protocol: "TCP".to_owned(),
            }],
            ..NpmPod::default()
        };
        let ports = named_port_sets(&pod);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].0.prefixed_name(), "namedport-serve-http");
        assert_eq!(ports[0].1.ip, "10.0.0.1,8080");
    }

    #[test]
    fn label_diffs_map_back_to_set_types() {
        let sets = label_sets(&["k1".to_owned(), "k1:v1".to_owned()]);
        assert_eq!(sets[0].set_type, SetType::KeyLabelOfPod);
        assert_eq!(sets[1].set_type, SetType::KeyValueLabelOfPod);
    }
}
