use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound before jitter is applied
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Scale every delay by a random factor in [0.8, 1.2]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts. For tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: false,
            ..Default::default()
        }
    }

    /// `min(initial * multiplier^attempt, max)`, then jittered.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_backoff.as_millis() as f64);

        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.8..=1.2)
        } else {
            1.0
        };
        Duration::from_millis((capped_ms * factor) as u64)
    }
}

/// Trait to determine if an error is retryable
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for blobkeep_core::Error {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Result of a retried operation together with how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Retry a future operation with exponential backoff
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation_name: &str, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    retry_counting(config, operation_name, operation).await.result
}

/// Like [`retry_with_backoff`], also reporting the number of attempts made.
pub async fn retry_counting<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        let error = match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempt = attempts, "Operation succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(result),
                    attempts,
                };
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            debug!(
                operation = operation_name,
                error = %error,
                "Error is not retryable, failing immediately"
            );
            return RetryOutcome {
                result: Err(error),
                attempts,
            };
        }

        if attempts >= max_attempts {
            warn!(
                operation = operation_name,
                max_attempts,
                error = %error,
                "Operation failed after all retry attempts"
            );
            return RetryOutcome {
                result: Err(error),
                attempts,
            };
        }

        let backoff = config.backoff_duration(attempts - 1);
        warn!(
            operation = operation_name,
            attempt = attempts,
            max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Operation failed, retrying after backoff"
        );
        sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobkeep_core::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_eventually() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let outcome = retry_counting(&fast(5), "test_operation", || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(Error::transient("mem", "connection reset"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_fails_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(&fast(3), "test_operation", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(Error::transient("mem", "timeout"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let outcome = retry_counting(&RetryConfig::default(), "test_operation", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(Error::permanent("s3", "403 Forbidden"))
            }
        })
        .await;

        assert!(matches!(outcome.result, Err(Error::PermanentBackend { .. })));
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn test_backoff_duration_calculation() {
        let config = RetryConfig {
            jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(0), Duration::from_millis(500));
        assert_eq!(config.backoff_duration(1), Duration::from_millis(1000));
        assert_eq!(config.backoff_duration(2), Duration::from_millis(2000));
        // Capped at max_backoff
        assert_eq!(config.backoff_duration(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let config = RetryConfig::default();
        for _ in 0..200 {
            let delay = config.backoff_duration(10).as_millis();
            assert!((24_000..=36_000).contains(&delay), "delay {delay} out of range");
        }
    }
}
