//! Retrying delivery of an effect with exponential backoff.
//!
//! `deliver` runs an action and retries on failure, sleeping
//! `base_delay * 2^attempt` between attempts. An optional confirmation
//! predicate can demand proof of delivery: an action that returns `Ok` but
//! fails confirmation consumes a retry exactly like a thrown error.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

type ConfirmFn = Box<dyn Fn() -> bool + Send + Sync>;
type NotifyFn = Box<dyn Fn(u32) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Retries after the first attempt; the action runs `max_retries + 1`
    /// times at most.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

pub struct EventDelivery {
    config: DeliveryConfig,
    confirm: Option<ConfirmFn>,
    on_delivered: Option<NotifyFn>,
    on_exhausted: Option<NotifyFn>,
    delivered_count: AtomicU64,
    failed_count: AtomicU64,
}

impl EventDelivery {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            confirm: None,
            on_delivered: None,
            on_exhausted: None,
            delivered_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
        }
    }

    /// Require `confirm()` to return true before an attempt counts as
    /// delivered.
    pub fn with_confirm(mut self, confirm: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.confirm = Some(Box::new(confirm));
        self
    }

    /// Called with the number of attempts used, after a confirmed delivery.
    pub fn with_on_delivered(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_delivered = Some(Box::new(callback));
        self
    }

    /// Called with the number of attempts used, after the final failure.
    pub fn with_on_exhausted(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_exhausted = Some(Box::new(callback));
        self
    }

    /// Run `action` until it is confirmed delivered or retries run out.
    /// Returns `true` on confirmed delivery. No delay follows the final
    /// attempt.
    pub async fn deliver<F, Fut>(&self, action: F) -> bool
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let attempts = self.config.max_retries + 1;
        for attempt in 0..attempts {
            let confirmed = match action().await {
                Ok(()) => self.confirm.as_ref().is_none_or(|confirm| confirm()),
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "delivery attempt failed");
                    false
                }
            };

            if confirmed {
                self.delivered_count.fetch_add(1, Ordering::Relaxed);
                if let Some(callback) = &self.on_delivered {
                    callback(attempt + 1);
                }
                return true;
            }

            if attempt + 1 < attempts {
                let backoff = self.config.base_delay * 2u32.saturating_pow(attempt.min(20));
                tokio::time::sleep(backoff).await;
            }
        }

        self.failed_count.fetch_add(1, Ordering::Relaxed);
        if let Some(callback) = &self.on_exhausted {
            callback(attempts);
        }
        false
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered_count.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn config(max_retries: u32, base_ms: u64) -> DeliveryConfig {
        DeliveryConfig {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
        }
    }

    #[tokio::test]
    async fn failing_action_runs_exactly_retries_plus_one_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let delivery = EventDelivery::new(config(3, 1));

        let calls_in = Arc::clone(&calls);
        let ok = delivery
            .deliver(|| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("always down")
                }
            })
            .await;

        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(delivery.failed_count(), 1);
        assert_eq!(delivery.delivered_count(), 0);
    }

    #[tokio::test]
    async fn success_on_first_attempt_skips_retries() {
        let delivered_after = Arc::new(AtomicU32::new(0));
        let cb = Arc::clone(&delivered_after);
        let delivery = EventDelivery::new(config(5, 1))
            .with_on_delivered(move |attempts| cb.store(attempts, Ordering::SeqCst));

        let ok = delivery.deliver(|| async { Ok(()) }).await;
        assert!(ok);
        assert_eq!(delivered_after.load(Ordering::SeqCst), 1);
        assert_eq!(delivery.delivered_count(), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let delivery = EventDelivery::new(config(3, 1));

        let calls_in = Arc::clone(&calls);
        let ok = delivery
            .deliver(|| {
                let calls = Arc::clone(&calls_in);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("flaky")
                    }
                    Ok(())
                }
            })
            .await;

        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unconfirmed_success_consumes_retries() {
        let exhausted_after = Arc::new(AtomicU32::new(0));
        let cb = Arc::clone(&exhausted_after);
        let delivery = EventDelivery::new(config(2, 1))
            .with_confirm(|| false)
            .with_on_exhausted(move |attempts| cb.store(attempts, Ordering::SeqCst));

        let ok = delivery.deliver(|| async { Ok(()) }).await;
        assert!(!ok);
        assert_eq!(exhausted_after.load(Ordering::SeqCst), 3);
        assert_eq!(delivery.failed_count(), 1);
    }

    #[tokio::test]
    async fn backoff_doubles_between_attempts() {
        // 2 retries at 20ms base: gaps of >= 20ms and >= 40ms, and no gap
        // after the final attempt.
        let delivery = EventDelivery::new(config(2, 20));
        let start = Instant::now();
        let ok = delivery.deliver(|| async { anyhow::bail!("down") }).await;
        let elapsed = start.elapsed();

        assert!(!ok);
        assert!(
            elapsed >= Duration::from_millis(60),
            "expected >= 60ms of backoff, got {elapsed:?}"
        );
        assert!(
            elapsed < Duration::from_millis(400),
            "no delay should follow the final attempt, got {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn counters_are_monotonic_across_calls() {
        let delivery = EventDelivery::new(config(0, 1));
        assert!(delivery.deliver(|| async { Ok(()) }).await);
        assert!(!delivery.deliver(|| async { anyhow::bail!("down") }).await);
        assert!(delivery.deliver(|| async { Ok(()) }).await);
        assert_eq!(delivery.delivered_count(), 2);
        assert_eq!(delivery.failed_count(), 1);
    }
}
