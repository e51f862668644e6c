//! Bounded retry and backoff logic for Switchvault remote operations
//!
//! This crate provides the attempt loop shared by every remote interaction in
//! Switchvault: a fixed number of attempts, a pluggable wait between them, and
//! a classification of errors into transient (worth another attempt) and
//! permanent (stop immediately).

use backoff::backoff::{Backoff, Constant};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Terminal outcome of a retried operation
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: usize,
        source: E,
    },
    #[error("Permanent error in '{operation}' on attempt {attempts}: {source}")]
    Permanent {
        operation: String,
        attempts: usize,
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Permanent { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The error returned by the last attempt
    pub fn into_source(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Permanent { source, .. } => source,
        }
    }

    pub fn source_ref(&self) -> &E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Permanent { source, .. } => source,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = std::result::Result<T, RetryError<E>>;

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Wait strategy between two attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// The same interval before every retry
    Fixed { interval: Duration },
    /// Growing interval with jitter, capped at `max_interval`
    Exponential {
        initial_interval: Duration,
        max_interval: Duration,
        multiplier: f64,
    },
}

impl BackoffStrategy {
    /// Build the backoff state machine for one retried operation
    fn build(&self) -> Box<dyn Backoff + Send> {
        match self {
            BackoffStrategy::Fixed { interval } => Box::new(Constant::new(*interval)),
            BackoffStrategy::Exponential {
                initial_interval,
                max_interval,
                multiplier,
            } => Box::new(exponential_policy(*initial_interval, *max_interval, *multiplier)),
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Fixed {
            interval: Duration::from_secs(2),
        }
    }
}

/// Bounded retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one; values below 1 are treated as 1
    pub max_attempts: usize,
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: BackoffStrategy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Fixed-interval policy
    pub fn fixed(max_attempts: usize, interval: Duration) -> Self {
        Self::new(max_attempts, BackoffStrategy::Fixed { interval })
    }

    fn attempt_bound(&self) -> usize {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    /// Two attempts, two seconds apart
    fn default() -> Self {
        Self::new(2, BackoffStrategy::default())
    }
}

/// Execute an operation under the given retry policy
///
/// The closure receives the 1-based attempt number. Transient failures are
/// retried until `max_attempts` is reached, sleeping between attempts as the
/// policy's backoff dictates; a permanent failure stops immediately. The first
/// success short-circuits the loop.
pub async fn retry_with_policy<F, Fut, T, E>(
    op_name: &str,
    policy: &RetryPolicy,
    mut f: F,
) -> RetryResult<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let max_attempts = policy.attempt_bound();
    let mut backoff = policy.backoff.build();
    let mut attempt = 1;

    loop {
        debug!(operation = %op_name, attempt, "Attempting operation");

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation = %op_name, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) if err.is_permanent() => {
                warn!(operation = %op_name, attempt, error = %err, "Operation failed permanently");
                return Err(RetryError::Permanent {
                    operation: op_name.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }
            Err(err) => {
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        operation: op_name.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }

                let wait = backoff.next_backoff().unwrap_or(Duration::ZERO);
                warn!(
                    operation = %op_name,
                    attempt,
                    max_attempts,
                    error = %err,
                    wait_ms = wait.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

/// Exponential policy that never gives up on elapsed time; the attempt bound
/// is enforced by the caller
fn exponential_policy(initial: Duration, max: Duration, multiplier: f64) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_max_interval(max)
        .with_multiplier(multiplier)
        .with_max_elapsed_time(None)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (transient: {})", self.transient)
        }
    }

    impl RetryableError for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let result: RetryResult<&str, TestError> =
            retry_with_policy("test_op", &RetryPolicy::default(), |_attempt| async {
                Ok("success")
            })
            .await;

        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempt_count);
        let policy = RetryPolicy::fixed(3, Duration::from_secs(2));

        let result = retry_with_policy("test_op", &policy, move |_attempt| {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(TestError { transient: true })
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_exactly_max_attempts() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempt_count);

        let result: RetryResult<(), TestError> =
            retry_with_policy("test_op", &RetryPolicy::default(), move |_attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { transient: true }) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 2, .. }));
        assert_eq!(err.attempts(), 2);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_backoff_waits_between_attempts() {
        let start = tokio::time::Instant::now();
        let policy = RetryPolicy::fixed(3, Duration::from_secs(2));

        let _: RetryResult<(), TestError> = retry_with_policy("test_op", &policy, |_attempt| async {
            Err(TestError { transient: true })
        })
        .await;

        // Two waits between three attempts, none after the last
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_immediately() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempt_count);

        let result: RetryResult<(), TestError> =
            retry_with_policy("test_op", &RetryPolicy::fixed(5, Duration::ZERO), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { transient: false }) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent { attempts: 1, .. })));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let policy = RetryPolicy::fixed(0, Duration::ZERO);
        let result: RetryResult<u8, TestError> =
            retry_with_policy("test_op", &policy, |attempt| async move { Ok(attempt as u8) }).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn test_exponential_strategy_grows() {
        let strategy = BackoffStrategy::Exponential {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
        };
        let mut backoff = strategy.build();
        let waits: Vec<Duration> = (0..10).map(|_| backoff.next_backoff().unwrap()).collect();

        // Jitter keeps each wait within half the current interval either way
        assert!(waits[0] <= Duration::from_millis(150));
        for wait in &waits[5..] {
            assert!(*wait >= Duration::from_millis(500));
            assert!(*wait > waits[0]);
        }
        assert!(waits.iter().all(|w| *w <= Duration::from_millis(1500)));
    }
}
