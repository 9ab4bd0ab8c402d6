//! Retry utilities with exponential backoff.
//!
//! Used inside individual I/O steps only (embedding batches, store queries,
//! generation calls). There is no retry across a whole request.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Backoff multiplier (delay *= multiplier after each attempt).
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a retry configuration allowing `max_attempts` attempts in total.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// A configuration that never retries.
    #[must_use]
    pub fn once() -> Self {
        Self::new(1)
    }

    /// Set the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(delay.as_secs_f64() * self.multiplier).min(self.max_delay)
    }
}

/// Retry result indicating what happened.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Operation succeeded.
    Success { value: T, attempts: u32 },
    /// Operation failed after all retries, or with a non-retryable error.
    Failed { last_error: E, attempts: u32 },
}

impl<T, E> RetryResult<T, E> {
    /// Convert to a Result, discarding retry information.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success { value, .. } => Ok(value),
            RetryResult::Failed { last_error, .. } => Err(last_error),
        }
    }

    /// Number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryResult::Success { attempts, .. } | RetryResult::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Determines if an error is retryable.
pub trait Retryable {
    /// Returns true if the operation should be retried.
    fn is_retryable(&self) -> bool;

    /// Minimum wait the provider asked for before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Execute an async operation with exponential backoff retry.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> RetryResult<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    let mut delay = config.initial_delay;

    loop {
        attempts += 1;

        match operation().await {
            Ok(value) => return RetryResult::Success { value, attempts },
            Err(error) => {
                if attempts >= config.max_attempts || !error.is_retryable() {
                    return RetryResult::Failed {
                        last_error: error,
                        attempts,
                    };
                }

                let requested = error.retry_after();
                if let Some(wait) = requested.filter(|wait| *wait > config.max_delay) {
                    tracing::debug!(
                        attempt = attempts,
                        retry_after_ms = wait.as_millis() as u64,
                        "provider asked to wait longer than the retry budget allows"
                    );
                    return RetryResult::Failed {
                        last_error: error,
                        attempts,
                    };
                }

                // Jitter keeps concurrent callers from retrying in lockstep
                let jitter_ms = rand_jitter(delay.as_millis() as u64 / 4);
                let backoff = delay + Duration::from_millis(jitter_ms);
                let actual_delay = requested.map_or(backoff, |wait| backoff.max(wait));

                tracing::debug!(
                    attempt = attempts,
                    delay_ms = actual_delay.as_millis() as u64,
                    error = %error,
                    "transient failure, retrying"
                );

                sleep(actual_delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

fn rand_jitter(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    seed % max
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct ProviderFailure(&'static str);

    impl std::fmt::Display for ProviderFailure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    impl Retryable for ProviderFailure {
        fn is_retryable(&self) -> bool {
            self.0 == "throttled"
        }
    }

    #[derive(Debug)]
    struct Throttled(Duration);

    impl std::fmt::Display for Throttled {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "throttled, retry after {:?}", self.0)
        }
    }

    impl Retryable for Throttled {
        fn is_retryable(&self) -> bool {
            true
        }

        fn retry_after(&self) -> Option<Duration> {
            Some(self.0)
        }
    }

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig::new(attempts).with_initial_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let counter = AtomicU32::new(0);
        let result = with_retry(&fast(3), || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ProviderFailure>("answer")
        })
        .await;

        assert_eq!(result.attempts(), 1);
        assert_eq!(result.into_result().unwrap(), "answer");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_throttling_is_retried_until_success() {
        let counter = AtomicU32::new(0);
        let result = with_retry(&fast(3), || async {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderFailure("throttled"))
            } else {
                Ok("answer")
            }
        })
        .await;

        match result {
            RetryResult::Success { value, attempts } => {
                assert_eq!(value, "answer");
                assert_eq!(attempts, 3);
            }
            RetryResult::Failed { .. } => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let result = with_retry(&fast(3), || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ProviderFailure("unauthorized"))
        })
        .await;

        assert_eq!(result.attempts(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let counter = AtomicU32::new(0);
        let result = with_retry(&fast(3), || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ProviderFailure("throttled"))
        })
        .await;

        match result {
            RetryResult::Failed { attempts, .. } => assert_eq!(attempts, 3),
            RetryResult::Success { .. } => panic!("expected failure"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_after_sets_minimum_delay() {
        let counter = AtomicU32::new(0);
        let started = std::time::Instant::now();
        let result = with_retry(&fast(2), || async {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Throttled(Duration::from_millis(80)))
            } else {
                Ok("answer")
            }
        })
        .await;

        assert_eq!(result.attempts(), 2);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_retry_after_beyond_max_delay_gives_up() {
        let config = fast(3).with_max_delay(Duration::from_millis(50));
        let counter = AtomicU32::new(0);
        let result = with_retry(&config, || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Throttled(Duration::from_secs(30)))
        })
        .await;

        assert_eq!(result.attempts(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_secs(4))
            .with_max_delay(Duration::from_secs(6));
        assert_eq!(
            config.next_delay(Duration::from_secs(4)),
            Duration::from_secs(6)
        );
        assert_eq!(RetryConfig::once().max_attempts, 1);
        assert_eq!(RetryConfig::new(0).max_attempts, 1);
    }
}
