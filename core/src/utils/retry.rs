//! Retries operations under single use cooldown sequences
//!
//! The retrier only retries errors the [`crate::Error::is_temporary`] check
//! says are worth retrying. Everything else is handed straight back to the
//! caller so validation problems never spin in a retry loop.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

use crate::Error;

/// Builds single use cooldown sequences for the retrier
#[derive(Debug, Clone)]
pub enum CooldownFactory {
    /// Wait the same amount of time between every attempt
    Fixed(Duration),
    /// Wait base * factor^n before attempt n
    Exponential {
        /// The delay before the first retry
        base: Duration,
        /// The multiplier applied on each later retry
        factor: u32,
    },
    /// Cap how many delays an inner factory may hand out
    Max(usize, Box<CooldownFactory>),
    /// Retry immediately with no delay
    AsFastAsPossible,
}

impl CooldownFactory {
    /// Create an exponential cooldown factory
    ///
    /// # Arguments
    ///
    /// * `base` - The delay before the first retry
    /// * `factor` - The multiplier applied on each later retry
    pub fn exponential(base: Duration, factor: u32) -> Self {
        CooldownFactory::Exponential { base, factor }
    }

    /// Cap the number of attempts of an inner factory
    ///
    /// # Arguments
    ///
    /// * `attempts` - The max number of delays to hand out
    /// * `inner` - The factory producing the delays
    pub fn max(attempts: usize, inner: CooldownFactory) -> Self {
        CooldownFactory::Max(attempts, Box::new(inner))
    }

    /// Produce a fresh single use cooldown sequence
    pub fn cooldown(&self) -> Cooldown {
        // walk any nested caps down to the base plan keeping the tightest cap
        let mut plan = self;
        let mut remaining = None;
        while let CooldownFactory::Max(cap, inner) = plan {
            remaining = Some(remaining.map_or(*cap, |kept: usize| kept.min(*cap)));
            plan = inner;
        }
        Cooldown {
            plan: plan.clone(),
            attempt: 0,
            remaining,
        }
    }
}

/// A single use sequence of delays between retry attempts
pub struct Cooldown {
    /// The plan delays are computed from (caps already flattened)
    plan: CooldownFactory,
    /// How many delays have been handed out so far
    attempt: u32,
    /// How many delays may still be handed out if capped
    remaining: Option<usize>,
}

impl Cooldown {
    /// Get the next delay in this sequence
    pub fn next_delay(&mut self) -> Result<Duration, Error> {
        // enforce the attempt cap if one was set
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return Err(Error::MaxAttempts(self.attempt as usize));
            }
            *remaining -= 1;
        }
        let delay = match &self.plan {
            CooldownFactory::Fixed(delay) => *delay,
            CooldownFactory::Exponential { base, factor } => base
                .checked_mul(factor.saturating_pow(self.attempt))
                .unwrap_or(Duration::MAX),
            CooldownFactory::AsFastAsPossible => Duration::ZERO,
            // caps are flattened when the sequence is built
            CooldownFactory::Max(..) => Duration::ZERO,
        };
        self.attempt += 1;
        Ok(delay)
    }

    /// How many delays this sequence has handed out
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Retry an operation until it succeeds, fails permanently, or is canceled
///
/// Cancellation wins over sleeping: if the stop channel flips while we are
/// cooling down the stop error is returned unwrapped.
///
/// # Arguments
///
/// * `stop` - The channel the caller cancels us through
/// * `factory` - The factory to build this retry's cooldown sequence from
/// * `op` - The operation to retry
pub async fn retry<T, F, Fut>(
    stop: &mut watch::Receiver<bool>,
    factory: &CooldownFactory,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    // build a fresh single use cooldown sequence
    let mut cooldown = factory.cooldown();
    loop {
        // bail out if our caller already asked us to stop
        if *stop.borrow() {
            return Err(Error::Canceled);
        }
        // call the operation
        match op().await {
            Ok(val) => return Ok(val),
            // only temporary errors are retried
            Err(err) if err.is_temporary() => {
                // get the next delay in the sequence
                let delay = cooldown.next_delay()?;
                // sleep unless the stop channel flips first
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        () = &mut sleep => break,
                        changed = stop.changed() => {
                            match changed {
                                Ok(()) if *stop.borrow() => return Err(Error::Canceled),
                                Ok(()) => (),
                                // the stop sender is gone so nothing can cancel us now
                                Err(_) => {
                                    sleep.as_mut().await;
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A boxed future so flaky ops have a nameable type
    type FlakyFut = std::pin::Pin<Box<dyn Future<Output = Result<usize, Error>>>>;

    /// Build an op that fails with a temporary error a fixed number of times
    fn flaky(fails: usize) -> (Arc<AtomicUsize>, impl FnMut() -> FlakyFut) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let op = move || -> FlakyFut {
            let seen = seen.clone();
            Box::pin(async move {
                let call = seen.fetch_add(1, Ordering::SeqCst);
                if call < fails {
                    Err(Error::transient("busy"))
                } else {
                    Ok(call)
                }
            })
        };
        (calls, op)
    }

    #[test]
    fn exponential_delays() {
        let factory = CooldownFactory::exponential(Duration::from_millis(10), 2);
        let mut cooldown = factory.cooldown();
        assert_eq!(cooldown.next_delay().unwrap(), Duration::from_millis(10));
        assert_eq!(cooldown.next_delay().unwrap(), Duration::from_millis(20));
        assert_eq!(cooldown.next_delay().unwrap(), Duration::from_millis(40));
    }

    #[test]
    fn capped_delays() {
        let factory = CooldownFactory::max(2, CooldownFactory::Fixed(Duration::from_millis(5)));
        let mut cooldown = factory.cooldown();
        assert!(cooldown.next_delay().is_ok());
        assert!(cooldown.next_delay().is_ok());
        // the third delay must fail with MaxAttempts
        match cooldown.next_delay() {
            Err(Error::MaxAttempts(2)) => (),
            other => panic!("expected MaxAttempts, got {other:?}"),
        }
    }

    #[test]
    fn nested_caps_keep_the_tightest() {
        let factory = CooldownFactory::max(5, CooldownFactory::max(1, CooldownFactory::AsFastAsPossible));
        let mut cooldown = factory.cooldown();
        assert!(cooldown.next_delay().is_ok());
        assert!(cooldown.next_delay().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_temporary_errors() {
        let (_, stop) = stop_pair();
        let mut stop = stop;
        // fail 4 times then succeed on the 5th call
        let (calls, op) = flaky(4);
        let factory = CooldownFactory::max(10, CooldownFactory::Fixed(Duration::from_millis(1)));
        let out = retry(&mut stop, &factory, op).await.unwrap();
        assert_eq!(out, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn permanent_errors_return_immediately() {
        let (_, mut stop) = stop_pair();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let factory = CooldownFactory::AsFastAsPossible;
        let out: Result<(), Error> = retry(&mut stop, &factory, move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(Error::validation("bad pod ip"))
            }
        })
        .await;
        assert!(matches!(out, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_max_attempts() {
        let (_, mut stop) = stop_pair();
        // fail far more times than the cap allows
        let (calls, op) = flaky(100);
        let factory = CooldownFactory::max(3, CooldownFactory::AsFastAsPossible);
        let out = retry(&mut stop, &factory, op).await;
        assert!(matches!(out, Err(Error::MaxAttempts(3))));
        // one call per allowed delay plus the initial call
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn canceled_before_first_call() {
        let (tx, mut stop) = stop_pair();
        tx.send(true).unwrap();
        let (calls, op) = flaky(0);
        let out = retry(&mut stop, &CooldownFactory::AsFastAsPossible, op).await;
        assert!(matches!(out, Err(Error::Canceled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    /// Build a stop channel pair for tests
    fn stop_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }
}
