//! Wires the controllers to a dataplane and supervises their tasks

use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{Level, event};

use warden::{Conf, Error};
use warden_dataplane::{DataPlane, Dataplane, backend_from_conf};

use crate::args::{Args, Mode};

use super::cache::SharedCache;
use super::controllers::{NamespaceController, NetPolController, PodController};
use super::server::GoalServer;
use super::shim::DpShim;

/// The controller process supervisor
pub struct Supervisor {
    /// The Warden config
    conf: Conf,
    /// The spawned task handles
    handles: Vec<JoinHandle<Result<(), Error>>>,
    /// Flipping this drains every task
    stop: watch::Sender<bool>,
}

impl Supervisor {
    /// Build the dataplane and spawn every controller task
    ///
    /// # Arguments
    ///
    /// * `args` - The command line args passed to the controller
    /// * `conf` - The Warden config
    pub async fn new(args: Args, conf: Conf) -> Result<Self, Error> {
        let client = kube::Client::try_default()
            .await
            .map_err(|error| Error::new(format!("failed to build a k8s client: {error}")))?;
        let (stop, stop_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(5);
        // pick the dataplane the controllers will program
        let dataplane: Arc<dyn Dataplane> = match args.mode {
            Mode::Direct => {
                let backend = backend_from_conf(&conf).await?;
                let dataplane = Arc::new(DataPlane::new(&conf.node_name, backend));
                dataplane.bootup().await?;
                // the background reconcile tick only exists in direct mode
                let ticker = dataplane.clone();
                let tick = std::time::Duration::from_secs(conf.controller.reconcile);
                let mut tick_stop = stop_rx.clone();
                handles.push(tokio::spawn(async move {
                    let mut interval = tokio::time::interval(tick);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            changed = tick_stop.changed() => {
                                if changed.is_err() || *tick_stop.borrow() {
                                    return Ok(());
                                }
                            }
                            _ = interval.tick() => {
                                if let Err(error) = ticker.reconcile().await {
                                    event!(Level::WARN, error = %error, "reconcile tick failed");
                                }
                            }
                        }
                    }
                }));
                dataplane
            }
            Mode::Remote => {
                let shim = Arc::new(DpShim::new());
                shim.bootup().await?;
                // daemons dial in and get hydrated by the goal state server
                let server = GoalServer::new(shim.clone(), conf.goal_state.listen.clone());
                let server_stop = stop_rx.clone();
                handles.push(tokio::spawn(async move { server.serve(server_stop).await }));
                shim
            }
        };
        let cache = Arc::new(Mutex::new(SharedCache::default()));
        handles.push(tokio::spawn(PodController::start(
            client.clone(),
            dataplane.clone(),
            cache.clone(),
            conf.controller.clone(),
            stop_rx.clone(),
        )));
        handles.push(tokio::spawn(NamespaceController::start(
            client.clone(),
            dataplane.clone(),
            cache,
            conf.controller.clone(),
            stop_rx.clone(),
        )));
        handles.push(tokio::spawn(NetPolController::start(
            client,
            dataplane,
            conf.platform,
            conf.controller.clone(),
            stop_rx,
        )));
        Ok(Supervisor {
            conf,
            handles,
            stop,
        })
    }

    /// Supervise the spawned tasks until one dies or we are signaled
    pub async fn start(mut self) -> Result<(), Error> {
        event!(
            Level::INFO,
            platform = %self.conf.platform,
            "warden controller running"
        );
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    event!(Level::INFO, "shutting down");
                    let _ = self.stop.send(true);
                    // give every task a chance to drain
                    for handle in self.handles.drain(..) {
                        handle.await??;
                    }
                    return Ok(());
                }
                () = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                    // a finished task this early is a crash worth surfacing
                    for handle in self.handles.iter_mut() {
                        if handle.is_finished() {
                            handle.await??;
                            return Err(Error::new("a controller task exited unexpectedly"));
                        }
                    }
                }
            }
        }
    }
}
