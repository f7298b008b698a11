//! Wires the node's dataplane to the goal state channel

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Level, event};

use warden::{Conf, Error};
use warden_dataplane::{DataPlane, backend_from_conf};

use super::client;
use super::processor::GoalStateProcessor;

/// How many undelivered events the inbound channel may hold
const INBOUND_DEPTH: usize = 256;

/// The node daemon
pub struct Daemon {
    /// The Warden config
    conf: Conf,
    /// The spawned task handles
    handles: Vec<JoinHandle<Result<(), Error>>>,
    /// Flipping this drains every task
    stop: watch::Sender<bool>,
}

impl Daemon {
    /// Boot the dataplane and spawn the processor and client tasks
    ///
    /// A bootup failure here is fatal: the process exits non zero and the
    /// orchestrator restarts it.
    ///
    /// # Arguments
    ///
    /// * `conf` - The Warden config
    pub async fn new(conf: Conf) -> Result<Self, Error> {
        let backend = backend_from_conf(&conf).await?;
        let dataplane = Arc::new(DataPlane::new(&conf.node_name, backend));
        dataplane.bootup().await?;
        let (stop, stop_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_DEPTH);
        let mut handles = Vec::with_capacity(3);
        // the single threaded event loop
        let processor = GoalStateProcessor::new(
            dataplane.clone(),
            inbound_rx,
            conf.goal_state.retry_depth,
            stop_rx.clone(),
        );
        handles.push(tokio::spawn(processor.run()));
        // the connection to the controller
        handles.push(tokio::spawn(client::run(
            conf.goal_state.connect.clone(),
            inbound_tx,
            stop_rx.clone(),
        )));
        // the background reconcile tick
        let ticker = dataplane.clone();
        let tick = std::time::Duration::from_secs(conf.controller.reconcile);
        let mut tick_stop = stop_rx;
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
        Ok(Daemon {
            conf,
            handles,
            stop,
        })
    }

    /// Force one full endpoint cache refresh and return
    ///
    /// The normal refresh strategy is event driven; this is the escape hatch
    /// for debugging a cache that looks out of step with HNS.
    ///
    /// # Arguments
    ///
    /// * `conf` - The Warden config
    pub async fn debug_refresh(conf: Conf) -> Result<(), Error> {
        let backend = backend_from_conf(&conf).await?;
        let dataplane = DataPlane::new(&conf.node_name, backend);
        dataplane.refresh_endpoints().await?;
        event!(Level::INFO, "endpoint cache refreshed");
        Ok(())
    }

    /// Supervise the spawned tasks until one dies or we are signaled
    pub async fn start(mut self) -> Result<(), Error> {
        event!(
            Level::INFO,
            node = %self.conf.node_name,
            platform = %self.conf.platform,
            "warden daemon running"
        );
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    event!(Level::INFO, "shutting down");
                    let _ = self.stop.send(true);
                    for handle in self.handles.drain(..) {
                        handle.await??;
                    }
                    return Ok(());
                }
                () = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                    for handle in self.handles.iter_mut() {
                        if handle.is_finished() {
                            handle.await??;
                            return Err(Error::new("a daemon task exited unexpectedly"));
                        }
                    }
                }
            }
        }
    }
}
