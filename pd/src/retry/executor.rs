//! Exponential backoff with jitter

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use super::classify::{Classifier, ErrorClass, ErrorSignal};
use crate::config::RetryConfig;

/// Attempt budget and delay shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap on the exponential part of the delay
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to every delay
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// `min(base * 2^(attempt-1), cap)` for the attempt that just failed
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff plus random jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff(attempt) + jitter(self.jitter)
    }
}

pub(crate) fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let ms = rand::rng().random_range(0..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

/// Why a retried operation gave up
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Classified as fatal; returned on the attempt it happened
    #[error("{0}")]
    Fatal(E),

    /// Still retriable after the last allowed attempt
    #[error("retries exhausted after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// The last underlying error
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Run `op` until it succeeds, fails fatally, or `policy.max_attempts` is used up
pub async fn execute_with_retry<T, E, F, Fut>(
    mut op: F,
    policy: &RetryPolicy,
    classifier: &Classifier,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ErrorSignal + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    debug!(max_attempts, "execute_with_retry: called");

    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "execute_with_retry: succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                if classifier.classify(&e) == ErrorClass::Fatal {
                    debug!(attempt, error = %e, "execute_with_retry: fatal error");
                    return Err(RetryError::Fatal(e));
                }
                if attempt >= max_attempts {
                    warn!(attempt, error = %e, "Retries exhausted");
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retriable error, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Synthetic(&'static str);

    impl fmt::Display for Synthetic {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl ErrorSignal for Synthetic {
        fn message(&self) -> String {
            self.0.to_string()
        }
    }

    #[tokio::test]
    async fn test_always_retriable_performs_exactly_n_attempts() {
        let mut calls = 0u32;
        let result: Result<(), _> = execute_with_retry(
            || {
                calls += 1;
                async { Err(Synthetic("429 Too Many Requests")) }
            },
            &RetryPolicy::immediate(4),
            &Classifier::standard(),
        )
        .await;

        assert_eq!(calls, 4);
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last.0, "429 Too Many Requests");
            }
            other => panic!("expected exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fatal_error_propagates_immediately() {
        let mut calls = 0u32;
        let result: Result<(), _> = execute_with_retry(
            || {
                calls += 1;
                async { Err(Synthetic("invalid argument")) }
            },
            &RetryPolicy::immediate(10),
            &Classifier::standard(),
        )
        .await;

        assert_eq!(calls, 1);
        assert!(matches!(result, Err(RetryError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let mut calls = 0u32;
        let result = execute_with_retry(
            || {
                calls += 1;
                let n = calls;
                async move {
                    if n < 3 {
                        Err(Synthetic("service unavailable: overloaded"))
                    } else {
                        Ok(n)
                    }
                }
            },
            &RetryPolicy::immediate(5),
            &Classifier::standard(),
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let mut calls = 0u32;
        let _: Result<(), _> = execute_with_retry(
            || {
                calls += 1;
                async { Err(Synthetic("timeout")) }
            },
            &RetryPolicy::immediate(0),
            &Classifier::standard(),
        )
        .await;
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(180),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(15));
        assert_eq!(policy.backoff(2), Duration::from_secs(30));
        assert_eq!(policy.backoff(4), Duration::from_secs(120));
        assert_eq!(policy.backoff(5), Duration::from_secs(180));
        assert_eq!(policy.backoff(40), Duration::from_secs(180));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 1..5 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= policy.backoff(attempt));
            assert!(delay <= policy.backoff(attempt) + policy.jitter);
        }
    }
}
