//! Fan-out coordinator
//!
//! Runs a set of idempotent task factories concurrently and retries only the
//! rate-limited subset, as a group, for a bounded number of rounds. Other
//! failures are dropped on the spot. The batch never fails as a whole.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::FanOutConfig;
use crate::retry::{Classifier, ErrorSignal};

/// Round budget and per-round delay shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutPolicy {
    pub max_rounds: u32,
    pub base_delay: Duration,
    pub jitter: Duration,
}

impl Default for FanOutPolicy {
    fn default() -> Self {
        Self::from_config(&FanOutConfig::default())
    }
}

impl FanOutPolicy {
    pub fn from_config(config: &FanOutConfig) -> Self {
        Self {
            max_rounds: config.max_rounds,
            base_delay: Duration::from_millis(config.base_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// No waiting between rounds
    pub fn immediate(max_rounds: u32) -> Self {
        Self {
            max_rounds,
            base_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay after `round` before the next one: `base * 2^(round-1)` plus jitter
    pub fn delay_for(&self, round: u32) -> Duration {
        let factor = 2u32.saturating_pow(round.saturating_sub(1));
        self.base_delay.saturating_mul(factor) + crate::retry::jitter(self.jitter)
    }
}

/// What happened to each factory, by index
#[derive(Debug)]
pub struct BatchReport<T, E> {
    pub succeeded: Vec<(usize, T)>,
    /// Failed with a non-retriable error; never re-invoked
    pub dropped: Vec<(usize, E)>,
    /// Still failing with a retriable error after the last round
    pub exhausted: Vec<(usize, E)>,
    pub rounds: u32,
}

impl<T, E> BatchReport<T, E> {
    pub fn is_complete(&self) -> bool {
        self.dropped.is_empty() && self.exhausted.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.dropped.len() + self.exhausted.len()
    }
}

/// Run every factory, retrying the retriable failures in later rounds
pub async fn run_batch<T, E, F, Fut>(
    factories: &[F],
    policy: &FanOutPolicy,
    classifier: &Classifier,
) -> BatchReport<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ErrorSignal + Display,
{
    debug!(tasks = factories.len(), max_rounds = policy.max_rounds, "run_batch: called");
    let max_rounds = policy.max_rounds.max(1);
    let mut report = BatchReport {
        succeeded: Vec::new(),
        dropped: Vec::new(),
        exhausted: Vec::new(),
        rounds: 0,
    };

    let mut pending: Vec<usize> = (0..factories.len()).collect();
    while !pending.is_empty() {
        report.rounds += 1;
        let round = report.rounds;
        debug!(round, pending = pending.len(), "run_batch: starting round");

        let results = join_all(pending.iter().map(|&idx| factories[idx]())).await;

        let mut retry = Vec::new();
        for (idx, result) in pending.iter().copied().zip(results) {
            match result {
                Ok(value) => report.succeeded.push((idx, value)),
                Err(e) if classifier.is_retriable(&e) => {
                    debug!(idx, round, error = %e, "run_batch: retriable failure");
                    retry.push((idx, e));
                }
                Err(e) => {
                    warn!(idx, round, error = %e, "Task failed permanently, dropping");
                    report.dropped.push((idx, e));
                }
            }
        }

        if retry.is_empty() {
            break;
        }
        if round >= max_rounds {
            warn!(remaining = retry.len(), rounds = round, "Fan-out rounds exhausted");
            report.exhausted = retry;
            break;
        }

        let delay = policy.delay_for(round);
        info!(
            retrying = retry.len(),
            round,
            delay_ms = delay.as_millis() as u64,
            "Rate limited tasks, backing off before next round"
        );
        tokio::time::sleep(delay).await;
        pending = retry.into_iter().map(|(idx, _)| idx).collect();
    }

    report.succeeded.sort_by_key(|(idx, _)| *idx);
    debug!(
        succeeded = report.succeeded.len(),
        dropped = report.dropped.len(),
        exhausted = report.exhausted.len(),
        rounds = report.rounds,
        "run_batch: finished"
    );
    report
}
