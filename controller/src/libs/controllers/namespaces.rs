//! The namespace reconciler
//!
//! Keeps every namespace's hash set inside the all-namespaces list and inside
//! one label list per key and pair, diffing label changes against the shared
//! cache.

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use kube::runtime::reflector::{self, reflector, ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{Level, event};

use warden::Error;
use warden::conf::ControllerConf;
use warden::models::{DeleteOption, IpSetMetadata, NpmNamespace};
use warden_dataplane::Dataplane;

use super::super::cache::SharedCache;
use super::super::queue::WorkQueue;
use super::{combine, object_key};

/// The namespace reconciler
pub struct NamespaceController {
    /// The dataplane being programmed
    dataplane: Arc<dyn Dataplane>,
    /// The cache shared with the pod controller
    cache: Arc<Mutex<SharedCache>>,
    /// The queue feeding the worker
    queue: Arc<WorkQueue>,
    /// The lister backing sync lookups
    store: Store<Namespace>,
}

impl NamespaceController {
    /// Watch namespaces and reconcile them until the stop channel flips
    ///
    /// # Arguments
    ///
    /// * `client` - The k8s client to watch through
    /// * `dataplane` - The dataplane being programmed
    /// * `cache` - The cache shared with the pod controller
    /// * `conf` - The controller config
    /// * `stop` - The channel the caller shuts us down through
    pub async fn start(
        client: kube::Client,
        dataplane: Arc<dyn Dataplane>,
        cache: Arc<Mutex<SharedCache>>,
        conf: ControllerConf,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(client);
        let (store, writer) = reflector::store();
        let queue = WorkQueue::new(
            Duration::from_millis(conf.requeue_base_ms),
            Duration::from_secs(conf.requeue_max_secs),
        );
        let controller = Arc::new(NamespaceController {
            dataplane,
            cache,
            queue: queue.clone(),
            store,
        });
        let worker = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.worker().await })
        };
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
                        Ok(Some(namespace)) => {
                            if let Some(key) = object_key(&namespace) {
                                controller.queue.add(&key);
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            event!(Level::WARN, error = %error, "namespace watch hiccup");
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
                    event!(Level::WARN, namespace = %key, error = %error, "dropping namespace after a permanent error");
                    self.queue.forget(&key);
                }
                Err(error) => {
                    event!(
                        Level::WARN,
                        namespace = %key,
                        error = %error,
                        "namespace sync failed, requeueing"
                    );
                    self.queue.add_rate_limited(&key);
                }
            }
            self.queue.done(&key);
        }
        Ok(())
    }

    /// Sync one namespace under the shared cache lock, always flushing after
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the namespace
    async fn sync(&self, name: &str) -> Result<(), Error> {
        let mut shared = self.cache.lock().await;
        let result = self.sync_namespace(&mut shared, name).await;
        let applied = self.dataplane.apply_dataplane().await;
        drop(shared);
        combine(result, applied)
    }

    /// Reconcile one namespace against the cache
    ///
    /// # Arguments
    ///
    /// * `shared` - The locked shared cache
    /// * `name` - The name of the namespace
    async fn sync_namespace(&self, shared: &mut SharedCache, name: &str) -> Result<(), Error> {
        let fetched = self.store.get(&ObjectRef::new(name));
        let Some(namespace) = fetched else {
            return self.delete_namespace(shared, name).await;
        };
        let fresh = NpmNamespace::new(
            name,
            namespace.metadata.labels.clone().unwrap_or_default(),
        );
        match shared.namespaces.get(name) {
            None => self.create_namespace(shared, fresh).await,
            Some(cached) if cached.labels == fresh.labels => Ok(()),
            Some(cached) => {
                let cached = cached.clone();
                self.change_namespace(shared, cached, fresh).await
            }
        }
    }

    /// Track a fresh namespace and join its label lists
    ///
    /// # Arguments
    ///
    /// * `shared` - The locked shared cache
    /// * `fresh` - The namespace to track
    async fn create_namespace(
        &self,
        shared: &mut SharedCache,
        fresh: NpmNamespace,
    ) -> Result<(), Error> {
        let set = fresh.set_metadata();
        self.dataplane.create_ipsets(std::slice::from_ref(&set)).await?;
        // every namespace set lives in the all-namespaces list
        self.dataplane
            .add_to_lists(&[IpSetMetadata::all_namespaces()], std::slice::from_ref(&set))
            .await?;
        let lists = fresh.label_lists();
        if !lists.is_empty() {
            self.dataplane
                .add_to_lists(&lists, std::slice::from_ref(&set))
                .await?;
        }
        event!(Level::INFO, namespace = %fresh.name, "tracking namespace");
        shared.namespaces.insert(fresh.name.clone(), fresh);
        Ok(())
    }

    /// Move a namespace between label lists after a label change
    ///
    /// # Arguments
    ///
    /// * `shared` - The locked shared cache
    /// * `cached` - The namespace as we knew it
    /// * `fresh` - The namespace as the event describes it
    async fn change_namespace(
        &self,
        shared: &mut SharedCache,
        cached: NpmNamespace,
        fresh: NpmNamespace,
    ) -> Result<(), Error> {
        let set = cached.set_metadata();
        let (to_leave, to_join) = cached.compare_label_lists(&fresh.labels);
        if !to_leave.is_empty() {
            self.dataplane
                .remove_from_lists(&to_leave, std::slice::from_ref(&set))
                .await?;
        }
        if !to_join.is_empty() {
            self.dataplane
                .add_to_lists(&to_join, std::slice::from_ref(&set))
                .await?;
        }
        shared.namespaces.insert(fresh.name.clone(), fresh);
        Ok(())
    }

    /// Untrack a namespace and leave every list it was in
    ///
    /// # Arguments
    ///
    /// * `shared` - The locked shared cache
    /// * `name` - The name of the namespace
    async fn delete_namespace(&self, shared: &mut SharedCache, name: &str) -> Result<(), Error> {
        let Some(cached) = shared.namespaces.remove(name) else {
            return Ok(());
        };
        let set = cached.set_metadata();
        let mut lists = cached.label_lists();
        lists.push(IpSetMetadata::all_namespaces());
        self.dataplane
            .remove_from_lists(&lists, std::slice::from_ref(&set))
            .await?;
        // the set itself lingers only if a policy still references it
        self.dataplane.delete_ipset(&set, DeleteOption::Soft).await?;
        event!(Level::INFO, namespace = %name, "untracked namespace");
        Ok(())
    }
}
