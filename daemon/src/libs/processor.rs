//! Replays goal state events onto the node's dataplane
//!
//! A single threaded loop over the inbound and retry channels. Payloads apply
//! in a fixed order (set applies, policy applies, policy removes, set
//! removes) so rules never reference sets the platform has not seen.
//! Hydration events additionally diff the local cache against the snapshot
//! and tear down everything the controller no longer knows about.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{Level, event};

use warden::Error;
use warden::models::{
    DeleteOption, EventType, Events, IpSetSnapshot, NpmNetworkPolicy, POLICY_APPLY, POLICY_REMOVE,
    SET_APPLY, SET_REMOVE,
};
use warden_dataplane::{DataPlane, Dataplane};

/// How many times one event is retried before it is dropped
const MAX_EVENT_TRIES: usize = 3;

/// An event that failed to apply and is waiting for another try
struct RetryEvent {
    /// The event to replay
    events: Events,
    /// How many times it has failed so far
    attempts: usize,
}

/// The node side goal state processor
pub struct GoalStateProcessor {
    /// The dataplane events replay onto
    dataplane: Arc<DataPlane>,
    /// The channel fresh events arrive on
    inbound: mpsc::Receiver<Events>,
    /// Where failed events are parked
    retry_tx: mpsc::Sender<RetryEvent>,
    /// Where failed events come back from
    retry_rx: mpsc::Receiver<RetryEvent>,
    /// Flipping this ends the loop
    stop: watch::Receiver<bool>,
}

impl GoalStateProcessor {
    /// Create a new processor
    ///
    /// # Arguments
    ///
    /// * `dataplane` - The dataplane events replay onto
    /// * `inbound` - The channel fresh events arrive on
    /// * `retry_depth` - How many failed events may wait for another try
    /// * `stop` - The channel the caller shuts us down through
    pub fn new(
        dataplane: Arc<DataPlane>,
        inbound: mpsc::Receiver<Events>,
        retry_depth: usize,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let (retry_tx, retry_rx) = mpsc::channel(retry_depth.max(1));
        GoalStateProcessor {
            dataplane,
            inbound,
            retry_tx,
            retry_rx,
            stop,
        }
    }

    /// Consume events until the stop channel flips or the inbound closes
    pub async fn run(mut self) -> Result<(), Error> {
        loop {
            tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        return Ok(());
                    }
                }
                parked = self.retry_rx.recv() => {
                    // the retry sender lives inside self so recv never ends
                    if let Some(parked) = parked {
                        self.handle(parked.events, parked.attempts).await;
                    }
                }
                next = self.inbound.recv() => {
                    match next {
                        Some(events) => self.handle(events, 0).await,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Apply one event, parking it for retry on failure
    ///
    /// # Arguments
    ///
    /// * `events` - The event to apply
    /// * `attempts` - How many times it has already failed
    async fn handle(&self, events: Events, attempts: usize) {
        if let Err(error) = self.process(&events).await {
            let attempts = attempts + 1;
            if attempts >= MAX_EVENT_TRIES {
                event!(
                    Level::ERROR,
                    kind = %events.event_type,
                    error = %error,
                    "dropping a goal state event after repeated failures"
                );
                return;
            }
            event!(
                Level::WARN,
                kind = %events.event_type,
                attempts,
                error = %error,
                "goal state event failed, parking for retry"
            );
            if self
                .retry_tx
                .try_send(RetryEvent { events, attempts })
                .is_err()
            {
                event!(Level::ERROR, "retry channel full, dropping a goal state event");
            }
        }
    }

    /// Apply one event's payloads in order
    ///
    /// # Arguments
    ///
    /// * `events` - The event to apply
    pub async fn process(&self, events: &Events) -> Result<(), Error> {
        let set_applies: Vec<IpSetSnapshot> = decode_payload(events, SET_APPLY);
        let policy_applies: Vec<NpmNetworkPolicy> = decode_payload(events, POLICY_APPLY);
        let policy_removes: Vec<String> = decode_payload(events, POLICY_REMOVE);
        let set_removes: Vec<String> = decode_payload(events, SET_REMOVE);
        // hydration tears down whatever the snapshot no longer carries
        let (stale_policies, stale_sets) = if events.event_type == EventType::Hydration {
            self.hydration_diff(&set_applies, &policy_applies).await
        } else {
            (Vec::default(), Vec::default())
        };
        {
            let mut ipsets = self.dataplane.ipsets().await;
            for snapshot in &set_applies {
                ipsets.apply_snapshot(snapshot)?;
            }
        }
        for policy in policy_applies {
            self.dataplane.add_policy(policy).await?;
        }
        for key in policy_removes.iter().chain(stale_policies.iter()) {
            self.dataplane.remove_policy(key).await?;
        }
        {
            let mut ipsets = self.dataplane.ipsets().await;
            for name in &set_removes {
                ipsets.delete_ipset(name, DeleteOption::Soft);
            }
            // sets the controller forgot about go regardless of references
            for name in &stale_sets {
                ipsets.delete_ipset(name, DeleteOption::Force);
            }
        }
        self.dataplane.apply_dataplane().await
    }

    /// Find the local state a hydration snapshot no longer carries
    ///
    /// # Arguments
    ///
    /// * `set_applies` - The sets the snapshot carries
    /// * `policy_applies` - The policies the snapshot carries
    async fn hydration_diff(
        &self,
        set_applies: &[IpSetSnapshot],
        policy_applies: &[NpmNetworkPolicy],
    ) -> (Vec<String>, Vec<String>) {
        let wanted_sets: HashSet<String> = set_applies
            .iter()
            .filter_map(|snapshot| snapshot.metadata.as_ref())
            .map(|meta| meta.prefixed_name())
            .collect();
        let wanted_policies: HashSet<String> = policy_applies
            .iter()
            .map(NpmNetworkPolicy::key)
            .collect();
        let stale_policies: Vec<String> = self
            .dataplane
            .policies()
            .await
            .keys()
            .into_iter()
            .filter(|key| !wanted_policies.contains(key))
            .collect();
        let stale_sets: Vec<String> = self
            .dataplane
            .ipsets()
            .await
            .set_names()
            .into_iter()
            .filter(|name| !wanted_sets.contains(name))
            .collect();
        if !stale_policies.is_empty() || !stale_sets.is_empty() {
            event!(
                Level::INFO,
                policies = stale_policies.len(),
                sets = stale_sets.len(),
                "hydration is garbage collecting stale state"
            );
        }
        (stale_policies, stale_sets)
    }
}

/// Decode one payload, skipping it with a log line on failure
///
/// A bad payload must never crash the loop; the rest of the event still
/// applies.
///
/// # Arguments
///
/// * `events` - The event the payload rides in
/// * `key` - The payload key to decode
fn decode_payload<T: serde::de::DeserializeOwned>(events: &Events, key: &str) -> Vec<T> {
    let Some(payload) = events.payloads.get(key) else {
        return Vec::default();
    };
    match payload.decode() {
        Ok(items) => items,
        Err(error) => {
            event!(Level::ERROR, key, error = %error, "skipping an undecodable payload");
            Vec::default()
        }
    }
}
