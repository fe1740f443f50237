//! QueueWorker - claims ready tasks and runs them through the fan-out coordinator

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::queue::TaskQueue;
use super::task::TaskStatus;
use crate::config::Config;
use crate::dispatch::{Invocation, StageInvoker, StageResponse};
use crate::error::{PipelineError, PipelineResult};
use crate::fanout::{FanOutPolicy, run_batch};
use crate::retry::Classifier;

/// Counters over a worker's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub batches: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl WorkerStats {
    pub fn processed(&self) -> usize {
        self.succeeded + self.skipped + self.requeued + self.failed
    }

    fn add(&mut self, other: WorkerStats) {
        self.batches += other.batches;
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.requeued += other.requeued;
        self.failed += other.failed;
    }
}

pub struct QueueWorker {
    queue: TaskQueue,
    invoker: Arc<dyn StageInvoker>,
    policy: FanOutPolicy,
    classifier: Classifier,
    batch_size: usize,
    idle_poll: Duration,
}

impl QueueWorker {
    pub fn new(queue: TaskQueue, invoker: Arc<dyn StageInvoker>, config: &Config) -> Self {
        Self {
            queue,
            invoker,
            policy: FanOutPolicy::from_config(&config.fanout),
            classifier: Classifier::rate_limit(),
            batch_size: config.fanout.batch_size.max(1),
            idle_poll: Duration::from_millis(config.dispatch.idle_poll_ms),
        }
    }

    pub fn with_policy(mut self, policy: FanOutPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Claim one batch and run it. Returns zeroed stats when nothing was ready.
    pub async fn run_once(&self) -> PipelineResult<WorkerStats> {
        debug!("run_once: called");
        let tasks = self.queue.claim_ready(self.batch_size).await?;
        let mut stats = WorkerStats::default();
        if tasks.is_empty() {
            return Ok(stats);
        }
        stats.batches = 1;
        info!(tasks = tasks.len(), "Running task batch");

        let factories: Vec<_> = tasks
            .iter()
            .map(|task| {
                let invocation = Invocation::from_task(task);
                let invoker = &self.invoker;
                move || {
                    let invocation = invocation.clone();
                    async move { invoker.invoke(invocation).await }
                }
            })
            .collect();
        let report = run_batch(&factories, &self.policy, &self.classifier).await;

        for (idx, response) in report.succeeded {
            let task = &tasks[idx];
            if let StageResponse::Skipped { reason } = &response {
                debug!(key = %task.key, %reason, "run_once: skipped");
                stats.skipped += 1;
            } else {
                stats.succeeded += 1;
            }
            self.queue.complete(task).await?;
        }

        for (idx, error) in report.dropped.into_iter().chain(report.exhausted) {
            let task = &tasks[idx];
            match self.queue.fail(task, &error).await? {
                TaskStatus::Failed => stats.failed += 1,
                _ => stats.requeued += 1,
            }
        }

        debug!(?stats, "run_once: done");
        Ok(stats)
    }

    /// Drain the queue, sleeping until delayed tasks come due, and return once
    /// nothing is queued or running
    pub async fn run_until_idle(&self) -> PipelineResult<WorkerStats> {
        debug!("run_until_idle: called");
        let mut total = WorkerStats::default();
        loop {
            let stats = self.run_once().await?;
            total.add(stats);
            if stats.batches > 0 {
                continue;
            }

            if self.queue.pending_count().await? == 0 {
                info!(?total, "Queue drained");
                return Ok(total);
            }
            let nap = match self.queue.next_run_at().await? {
                Some(run_at) => {
                    let wait_ms = (run_at - entitystore::now_ms()).max(0) as u64;
                    Duration::from_millis(wait_ms).min(self.idle_poll.max(Duration::from_millis(1)))
                }
                // everything left is running under another worker's lease, or blocked
                None => self.idle_poll,
            };
            debug!(nap_ms = nap.as_millis() as u64, "run_until_idle: waiting for work");
            tokio::time::sleep(nap).await;
        }
    }

    /// Poll for work until a shutdown signal arrives
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> PipelineResult<WorkerStats> {
        debug!("run: called");
        info!("QueueWorker starting");
        let mut interval = tokio::time::interval(self.idle_poll.max(Duration::from_millis(1)));
        let mut total = WorkerStats::default();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // keep draining while batches come back full of work
                    loop {
                        match self.run_once().await {
                            Ok(stats) if stats.batches > 0 => total.add(stats),
                            Ok(_) => break,
                            Err(e @ PipelineError::Conflict(_)) => {
                                debug!(error = %e, "run: queue write raced, retrying next tick");
                                break;
                            }
                            Err(e) => {
                                warn!(error = %e, "run: batch failed");
                                break;
                            }
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    debug!("run: shutdown signal received");
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!(?total, "QueueWorker stopped");
        Ok(total)
    }
}
