//! In-call retry for transient forge failures.
//!
//! Retries here are a convenience to ride out rate limits and flaky networks
//! inside a single operation; the authoritative retry mechanism for whole
//! operations is the poller, which re-drives from persisted state. Anything
//! [`ForgeError::is_transient`] rejects is returned to the caller untouched.

use std::future::Future;
use std::time::Duration;

use super::error::ForgeError;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (cap for exponential growth).
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Default retry configuration: 3 retries with 2s, 4s, 8s delays.
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(16),
        backoff_multiplier: 2.0,
    };

    /// Creates a new retry configuration.
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Computes the delay for the given retry attempt (0-indexed).
    ///
    /// The delay grows exponentially: `initial_delay * backoff_multiplier^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Executes an async operation, retrying transient errors with backoff.
///
/// Non-transient errors are returned immediately; a transient error is
/// returned once `config.max_retries` is exhausted.
pub async fn retry_with_backoff<T, F, Fut>(
    config: RetryConfig,
    mut operation: F,
) -> Result<T, ForgeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ForgeError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_transient() {
                    return Err(e);
                }
                attempt += 1;
                if attempt > config.max_retries {
                    return Err(e);
                }
                let delay = config.delay_for_attempt(attempt - 1);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying transient forge error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(4), 2.0)
    }

    fn network() -> ForgeError {
        ForgeError::Network {
            message: "connection reset".to_string(),
        }
    }

    #[test]
    fn default_delays_are_2_4_8() {
        let config = RetryConfig::DEFAULT;
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(8));
    }

    #[test]
    fn delay_respects_cap() {
        let config = RetryConfig::new(10, Duration::from_secs(1), Duration::from_secs(5), 2.0);
        assert_eq!(config.delay_for_attempt(9), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(fast_config(), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ForgeError>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_request_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(fast_config(), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<i32, _>(ForgeError::Refused {
                    status: 404,
                    message: "no such branch".to_string(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_fast_forward_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(fast_config(), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<i32, _>(ForgeError::NotFastForward {
                    branch: "main".to_string(),
                    message: "stale tip".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(ForgeError::NotFastForward { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn network_error_succeeds_on_third_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(fast_config(), move || {
            let count = c.fetch_add(1, Ordering::SeqCst);
            async move { if count < 2 { Err(network()) } else { Ok(42) } }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn network_error_exhausts_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(fast_config(), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(network()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 4); // initial + 3 retries
    }
}
