//! Retry policy for provider calls.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;

use super::ProviderResult;

/// Exponential backoff for transient provider errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between delays.
    pub multiplier: f64,
}

/// Outcome of a retried call.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result; transient errors are promoted to permanent.
    pub result: ProviderResult<T>,
    /// Number of calls made.
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(delay)
    }

    /// Runs `call` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut call: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match call().await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) if e.is_transient() && attempts < self.max_attempts => {
                    let delay = self.backoff(attempts);
                    debug!(
                        "{label}: transient error on attempt {attempts}/{}: {}; retrying in {delay:?}",
                        self.max_attempts,
                        e.message()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!("{label}: giving up after {attempts} attempts");
                    }
                    return Attempted {
                        result: Err(e.promote(attempts)),
                        attempts,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            multiplier: 2.0,
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = &AtomicU32::new(0);

        let outcome = fast(4)
            .run("bucket.site create", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::transient("throttled"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(outcome.result, Ok(7));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_promote() {
        let outcome: Attempted<()> = fast(3)
            .run("bucket.site create", || async { Err(ProviderError::transient("throttled")) })
            .await;

        assert_eq!(outcome.attempts, 3);
        let err = outcome.result.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("gave up after 3 attempts"));
    }

    #[tokio::test]
    async fn test_permanent_not_retried() {
        let calls = &AtomicU32::new(0);

        let outcome: Attempted<()> = fast(5)
            .run("bucket.site create", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::permanent("access denied"))
            })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.result, Err(ProviderError::permanent("access denied")));
    }
}
