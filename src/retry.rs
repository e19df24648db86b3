// Retry module - bounded retries with linear backoff
//
// This module is shared by two very different callers:
// 1. The agent sender, which retries HTTP deliveries answered with 500/503
// 2. The server, which retries storage calls that failed with a connection exception
//
// The retryer itself knows nothing about either transport. Callers hand it a
// predicate that decides whether an error is transient (sleep and try again)
// or fatal (return immediately).

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can tell whether repeating the failed operation might succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Marker wrapper for an error that is known to be transient.
///
/// Storage backends wrap driver errors they classify as "connection
/// exception" in this type, so the retry predicate only has to look for the
/// wrapper and never at driver-specific error codes.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct RetryableError {
    #[source]
    source: Box<dyn StdError + Send + Sync>,
}

impl RetryableError {
    pub fn new<E>(source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        RetryableError {
            source: source.into(),
        }
    }
}

/// Attempt count and linear backoff schedule.
///
/// Delays grow as `delay, delay + increment, delay + 2 * increment, ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: usize,

    /// Sleep before the first retry
    pub delay: Duration,

    /// Added to the sleep after every retry
    pub increment: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: usize, delay: Duration, increment: Duration) -> Self {
        RetryPolicy {
            attempts,
            delay,
            increment,
        }
    }

    /// Sleeps that separate consecutive attempts (one fewer than `attempts`).
    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        let RetryPolicy {
            attempts,
            delay,
            increment,
        } = *self;
        (0..attempts.saturating_sub(1) as u32).map(move |i| delay + increment * i)
    }
}

impl Default for RetryPolicy {
    /// Three attempts, sleeping 1s and then 3s.
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(2))
    }
}

type Condition<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Runs a fallible async operation up to `policy.attempts` times.
///
/// Build one retryer per distinct policy and share it (it is cheap to clone).
/// The setters take `&mut self`, so a retryer can't be reconfigured while
/// other tasks are using it.
pub struct Retryer<E> {
    policy: RetryPolicy,
    condition: Condition<E>,
}

impl<E> Clone for Retryer<E> {
    fn clone(&self) -> Self {
        Retryer {
            policy: self.policy,
            condition: Arc::clone(&self.condition),
        }
    }
}

impl<E> fmt::Debug for Retryer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retryer")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<E: fmt::Display> Retryer<E> {
    /// Creates a retryer that treats every error as retryable.
    pub fn new(policy: RetryPolicy) -> Self {
        Retryer {
            policy,
            condition: Arc::new(|_| true),
        }
    }

    /// Replaces the retry predicate.
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.set_condition(condition);
        self
    }

    pub fn set_condition<F>(&mut self, condition: F)
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.condition = Arc::new(condition);
    }

    pub fn set_attempts(&mut self, attempts: usize) {
        self.policy.attempts = attempts;
    }

    pub fn set_delay(&mut self, delay: Duration, increment: Duration) {
        self.policy.delay = delay;
        self.policy.increment = increment;
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Runs `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// # Returns
    /// * `Ok(T)` - The first successful result
    /// * `Err(E)` - The first non-retryable error, or the last error once
    ///   every attempt has been used
    ///
    /// A policy with zero attempts still runs `op` once.
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut delay = self.policy.delay;
        let mut attempt = 1;

        loop {
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Operation succeeded on attempt {}/{}", attempt, attempts);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !(self.condition)(&err) {
                return Err(err);
            }
            if attempt >= attempts {
                warn!("Giving up after {} attempt(s): {}", attempts, err);
                return Err(err);
            }

            warn!(
                "Attempt {}/{} failed: {}. Retrying in {:?}",
                attempt, attempts, err, delay
            );
            tokio::time::sleep(delay).await;
            delay += self.policy.increment;
            attempt += 1;
        }
    }
}

impl<E: Transient + fmt::Display> Retryer<E> {
    /// Creates a retryer that only retries errors reporting themselves as transient.
    pub fn transient(policy: RetryPolicy) -> Self {
        Retryer::new(policy).with_condition(|e: &E| e.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum TestError {
        Flaky,
        Fatal,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    fn policy(attempts: usize) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_secs(1), Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_every_attempt_on_transient_error() {
        let retryer = Retryer::transient(policy(4));
        let mut calls = 0;
        let start = Instant::now();

        let result: Result<(), TestError> = retryer
            .retry(|| {
                calls += 1;
                async { Err(TestError::Flaky) }
            })
            .await;

        assert_eq!(result, Err(TestError::Flaky));
        assert_eq!(calls, 4);
        // 1s + 3s + 5s of backoff, no sleep after the final attempt
        assert_eq!(start.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_attempted_once() {
        let retryer = Retryer::transient(policy(5));
        let mut calls = 0;
        let start = Instant::now();

        let result: Result<(), TestError> = retryer
            .retry(|| {
                calls += 1;
                async { Err(TestError::Fatal) }
            })
            .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_value_after_recovering() {
        let retryer = Retryer::transient(policy(3));
        let mut calls = 0;

        let result = retryer
            .retry(|| {
                calls += 1;
                let outcome = if calls < 3 {
                    Err(TestError::Flaky)
                } else {
                    Ok(calls)
                };
                async move { outcome }
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let retryer: Retryer<TestError> = Retryer::new(policy(0));
        let mut calls = 0;
        let _ = retryer
            .retry(|| {
                calls += 1;
                async { Err::<(), _>(TestError::Flaky) }
            })
            .await;
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_backoff_is_linear() {
        let delays: Vec<_> = policy(4).backoff().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5)
            ]
        );
    }

    #[test]
    fn test_setters_reconfigure_policy() {
        let mut retryer: Retryer<TestError> = Retryer::new(RetryPolicy::default());
        retryer.set_attempts(7);
        retryer.set_delay(Duration::from_millis(10), Duration::from_millis(5));
        assert_eq!(
            retryer.policy(),
            RetryPolicy::new(7, Duration::from_millis(10), Duration::from_millis(5))
        );
    }

    #[test]
    fn test_retryable_error_keeps_source_message() {
        let err = RetryableError::new("connection refused");
        assert_eq!(err.to_string(), "connection refused");
    }
}
