//! Retry with exponential backoff for transient failures

use crate::{config::AdapterConfig, Error, Result};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Max attempts, including the first one
    pub max_attempts: u32,
    /// Initial retry delay
    pub initial_delay: Duration,
    /// Max retry delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy from adapter configuration
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }

    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay.max(self.initial_delay))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `op`, retrying retryable errors up to `policy.max_attempts` times
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts;
    let mut attempt = 0u32;

    backoff::future::retry(policy.backoff(), || {
        attempt += 1;
        let current = attempt;
        let fut = op();
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(e) if e.is_retryable() && current < max_attempts => {
                    warn!(
                        "{} failed (attempt {}/{}), retrying: {}",
                        operation, current, max_attempts, e
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) => {
                    if e.is_retryable() && max_attempts > 1 {
                        error!("{} failed after {} attempts: {}", operation, current, e);
                    }
                    Err(backoff::Error::permanent(e))
                }
            }
        }
    })
    .await
}

/// Await `fut` with a deadline, mapping expiry to [`Error::Timeout`]
pub async fn with_timeout<T, Fut>(limit: Duration, operation: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(limit.as_millis() as u64, operation)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_transient(&policy(3), "connect", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Connection("refused".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = retry_transient(&policy(2), "connect", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::Connection("refused".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = retry_transient(&policy(5), "connect", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::Authentication("denied".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_error() {
        let result: Result<()> = with_timeout(Duration::from_millis(50), "fetch", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout { millis: 50, .. })));
    }
}
