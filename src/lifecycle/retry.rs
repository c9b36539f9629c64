//! Bounded Retry and Polling
//!
//! One combinator serves both transient-failure retries against the array
//! and convergence polling (device node appearance). Both are bounded by a
//! fixed attempt count; intervals come from `backoff`'s exponential schedule.

use crate::error::Result;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt-bounded backoff schedule
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl RetryPolicy {
    /// Doubling intervals with jitter, capped at `max_interval`
    pub fn exponential(max_attempts: u32, initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval,
            max_interval,
            multiplier: 2.0,
            randomization_factor: 0.25,
        }
    }

    /// Same interval between every attempt
    pub fn constant(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            randomization_factor: 0.0,
        }
    }

    /// A single attempt
    pub fn once() -> Self {
        Self::constant(1, Duration::ZERO)
    }

    fn intervals(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run `op`, retrying transient failures until the attempt bound
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut intervals = self.intervals();
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = intervals.next_backoff().unwrap_or(self.max_interval);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Probe until it yields a value; `Ok(None)` once the bound is exceeded
    pub async fn poll<T, F, Fut>(&self, what: &str, mut probe: F) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let mut intervals = self.intervals();
        for attempt in 1..=self.max_attempts {
            if let Some(value) = probe().await? {
                return Ok(Some(value));
            }
            debug!(what, attempt, max_attempts = self.max_attempts, "Not converged yet");
            if attempt < self.max_attempts {
                let delay = intervals.next_backoff().unwrap_or(self.max_interval);
                tokio::time::sleep(delay).await;
            }
        }
        Ok(None)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(500), Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast(3)
            .retry("list", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::unavailable("list", "connection reset"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_bound() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast(2)
            .retry("list", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::unavailable("list", "503"))
            })
            .await;

        assert_matches!(result, Err(Error::Unavailable { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_conflicts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast(5)
            .retry("map", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Conflict {
                    resource: "ScVolume/1".into(),
                    reason: "mapped".into(),
                })
            })
            .await;

        assert_matches!(result, Err(Error::Conflict { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_converges() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::constant(4, Duration::from_millis(1));
        let found = policy
            .poll("device", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok((n == 2).then_some("/dev/sdc"))
            })
            .await
            .unwrap();

        assert_eq!(found, Some("/dev/sdc"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_is_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::constant(4, Duration::from_millis(1));
        let found: Option<()> = policy
            .poll("device", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();

        assert!(found.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
