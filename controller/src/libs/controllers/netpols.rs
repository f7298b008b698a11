//! The network policy reconciler
//!
//! Dedupes events by spec equality, hands changed policies to the translator,
//! and pushes the translation into the dataplane. Translation failures for
//! features the platform cannot enforce are permanent: the key is forgotten
//! instead of requeued.

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicySpec};
use kube::api::Api;
use kube::runtime::reflector::{self, reflector, ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{Level, event};

use warden::Error;
use warden::conf::{ControllerConf, Platform};
use warden_dataplane::Dataplane;

use super::super::queue::WorkQueue;
use super::super::translate;
use super::{combine, object_key};

/// The network policy reconciler
pub struct NetPolController {
    /// The dataplane being programmed
    dataplane: Arc<dyn Dataplane>,
    /// The queue feeding the worker
    queue: Arc<WorkQueue>,
    /// The lister backing sync lookups
    store: Store<NetworkPolicy>,
    /// The last spec seen per policy, for spec equality dedupe
    specs: Mutex<HashMap<String, NetworkPolicySpec>>,
    /// The platform translations must be enforceable on
    platform: Platform,
}

impl NetPolController {
    /// Watch network policies and reconcile them until the stop channel flips
    ///
    /// # Arguments
    ///
    /// * `client` - The k8s client to watch through
    /// * `dataplane` - The dataplane being programmed
    /// * `platform` - The platform translations must be enforceable on
    /// * `conf` - The controller config
    /// * `stop` - The channel the caller shuts us down through
    pub async fn start(
        client: kube::Client,
        dataplane: Arc<dyn Dataplane>,
        platform: Platform,
        conf: ControllerConf,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let api: Api<NetworkPolicy> = Api::all(client);
        let (store, writer) = reflector::store();
        let queue = WorkQueue::new(
            Duration::from_millis(conf.requeue_base_ms),
            Duration::from_secs(conf.requeue_max_secs),
        );
        let controller = Arc::new(NetPolController {
            dataplane,
            queue: queue.clone(),
            store,
            specs: Mutex::default(),
            platform,
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
                        Ok(Some(netpol)) => {
                            if let Some(key) = object_key(&netpol) {
                                controller.queue.add(&key);
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            event!(Level::WARN, error = %error, "network policy watch hiccup");
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
                    // unsupported features never become supported by retrying
                    event!(Level::ERROR, policy = %key, error = %error, "refusing to install policy");
                    self.queue.forget(&key);
                }
                Err(error) => {
                    event!(
                        Level::WARN,
                        policy = %key,
                        error = %error,
                        "policy sync failed, requeueing"
                    );
                    self.queue.add_rate_limited(&key);
                }
            }
            self.queue.done(&key);
        }
        Ok(())
    }

    /// Sync one policy, always flushing after
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the policy
    async fn sync(&self, key: &str) -> Result<(), Error> {
        let result = self.sync_netpol(key).await;
        let applied = self.dataplane.apply_dataplane().await;
        combine(result, applied)
    }

    /// Reconcile one policy against the spec cache
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the policy
    async fn sync_netpol(&self, key: &str) -> Result<(), Error> {
        let Some((namespace, name)) = key.split_once('/') else {
            return Err(Error::validation(format!("{key} is not a policy key")));
        };
        let fetched = self.store.get(&ObjectRef::new(name).within(namespace));
        let Some(netpol) = fetched else {
            // gone from the lister means the policy was deleted
            self.specs.lock().await.remove(key);
            event!(Level::INFO, policy = %key, "removing policy");
            return self.dataplane.remove_policy(key).await;
        };
        let fresh = netpol.spec.clone().unwrap_or_default();
        {
            let specs = self.specs.lock().await;
            // resyncs with an unchanged spec are no-ops
            if specs.get(key) == Some(&fresh) {
                return Ok(());
            }
        }
        let policy = translate::translate(&netpol, self.platform)?;
        event!(
            Level::INFO,
            policy = %key,
            acls = policy.acls.len(),
            "installing policy"
        );
        self.dataplane.add_policy(policy).await?;
        self.specs.lock().await.insert(key.to_owned(), fresh);
        Ok(())
    }
}
