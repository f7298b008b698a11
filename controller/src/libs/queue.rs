//! A rate limited workqueue that coalesces duplicate keys
//!
//! Enqueuing a key that is already pending merges into the pending slot, and a
//! key re-added while its worker is mid-sync is parked until `done` so each
//! key's reconciles stay serialized. Failed keys come back through
//! `add_rate_limited` under a capped exponential delay with jitter.

use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{Level, event};

/// The state behind a workqueue
#[derive(Default)]
struct QueueState {
    /// The keys ready to be handed to a worker, in order
    queue: VecDeque<String>,
    /// The keys waiting in the queue or parked behind a sync
    dirty: HashSet<String>,
    /// The keys a worker is currently syncing
    processing: HashSet<String>,
    /// How many times each key has failed since it was last forgotten
    failures: HashMap<String, u32>,
    /// Whether the queue is draining for shutdown
    shutdown: bool,
}

/// A rate limited workqueue keyed by namespace/name
pub struct WorkQueue {
    /// The guarded queue state
    state: Mutex<QueueState>,
    /// Wakes workers blocked on an empty queue
    notify: Notify,
    /// The delay of a key's first retry
    base_delay: Duration,
    /// The cap on retry delays
    max_delay: Duration,
}

impl WorkQueue {
    /// Create a new workqueue
    ///
    /// # Arguments
    ///
    /// * `base_delay` - The delay of a key's first retry
    /// * `max_delay` - The cap on retry delays
    pub fn new(base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        Arc::new(WorkQueue {
            state: Mutex::default(),
            notify: Notify::new(),
            base_delay,
            max_delay,
        })
    }

    /// Enqueue a key, coalescing with any pending copy
    ///
    /// # Arguments
    ///
    /// * `key` - The key to enqueue
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_owned());
        // keys mid-sync are parked until their worker calls done
        if !state.processing.contains(key) {
            state.queue.push_back(key.to_owned());
            self.notify.notify_one();
        }
    }

    /// Enqueue a key after a failure, under a growing delay
    ///
    /// # Arguments
    ///
    /// * `key` - The key to requeue
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock().unwrap();
            let failures = state.failures.entry(key.to_owned()).or_default();
            *failures += 1;
            // base * 2^(n-1) with a little jitter, capped
            let exp = self
                .base_delay
                .checked_mul(2u32.saturating_pow(*failures - 1))
                .unwrap_or(self.max_delay)
                .min(self.max_delay);
            let jitter = rand::rng().random_range(0..=self.base_delay.as_millis() as u64 / 2);
            exp + Duration::from_millis(jitter)
        };
        let queue = self.clone();
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Pull the next key, waiting until one is ready
    ///
    /// Returns None once the queue has shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark a key's sync as finished, releasing any parked copy
    ///
    /// # Arguments
    ///
    /// * `key` - The key the worker finished
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(key);
        // a copy that arrived mid-sync runs now
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_owned());
            self.notify.notify_one();
        }
    }

    /// Clear a key's failure history after a clean sync
    ///
    /// # Arguments
    ///
    /// * `key` - The key to forget
    pub fn forget(&self, key: &str) {
        self.state.lock().unwrap().failures.remove(key);
    }

    /// How many times a key has failed since it was last forgotten
    ///
    /// # Arguments
    ///
    /// * `key` - The key to look up
    pub fn failures(&self, key: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .failures
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// Stop accepting keys and wake every blocked worker
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        event!(Level::INFO, "workqueue shutting down");
        drop(state);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a queue with tiny delays for tests
    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(Duration::from_millis(1), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let queue = queue();
        queue.add("x/a");
        queue.add("x/a");
        queue.add("x/b");
        assert_eq!(queue.get().await.unwrap(), "x/a");
        assert_eq!(queue.get().await.unwrap(), "x/b");
        // both copies of x/a merged into one slot
        queue.shutdown();
        queue.done("x/a");
        queue.done("x/b");
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn keys_added_mid_sync_wait_for_done() {
        let queue = queue();
        queue.add("x/a");
        let key = queue.get().await.unwrap();
        // the same key arrives while its worker is mid-sync
        queue.add("x/a");
        {
            let state = queue.state.lock().unwrap();
            assert!(state.queue.is_empty());
        }
        // done releases the parked copy
        queue.done(&key);
        assert_eq!(queue.get().await.unwrap(), "x/a");
    }

    #[tokio::test]
    async fn rate_limited_adds_grow_failures() {
        let queue = queue();
        queue.add_rate_limited("x/a");
        queue.add_rate_limited("x/a");
        assert_eq!(queue.failures("x/a"), 2);
        // the key still shows up after its delay
        let key = queue.get().await.unwrap();
        assert_eq!(key, "x/a");
        queue.forget(&key);
        assert_eq!(queue.failures("x/a"), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_workers() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        // give the worker a beat to block
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        // adds after shutdown are refused
        queue.add("x/a");
        assert_eq!(queue.get().await, None);
    }
}
