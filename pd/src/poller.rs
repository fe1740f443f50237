//! Completion poller
//!
//! Counts children that satisfy a predicate, fetching them in bounded id
//! batches. `wait_for_children` blocks until all are satisfied or a deadline
//! passes, waking early on `ChildFinished` events and falling back to a fixed
//! polling interval. Timing out is not an error: finality here is advisory.

use std::time::Duration;

use entitystore::{DocRef, Filter, Query};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PollerConfig;
use crate::domain::{Entity, EntityKind, fields};
use crate::error::PipelineResult;
use crate::events::{EventBus, PipelineEvent};
use crate::state::StateManager;

/// Snapshot of one pass over the children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollStatus {
    pub satisfied: usize,
    pub total: usize,
}

impl PollStatus {
    pub fn is_complete(&self) -> bool {
        self.satisfied >= self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Complete(PollStatus),
    TimedOut(PollStatus),
}

/// Default child predicate: the child finished its own lifecycle
pub fn child_done(child: &Entity) -> bool {
    child.lifecycle.is_terminal()
}

#[derive(Clone)]
pub struct CompletionPoller {
    state: StateManager,
    events: EventBus,
    interval: Duration,
    deadline: Duration,
    id_batch_size: usize,
}

impl CompletionPoller {
    pub fn new(state: StateManager, events: EventBus, config: &PollerConfig) -> Self {
        Self {
            state,
            events,
            interval: Duration::from_secs(config.interval_secs),
            deadline: Duration::from_secs(config.deadline_secs),
            id_batch_size: config.id_batch_size.clamp(1, entitystore::MAX_IN_VALUES),
        }
    }

    /// Override interval and deadline
    pub fn with_timing(mut self, interval: Duration, deadline: Duration) -> Self {
        self.interval = interval;
        self.deadline = deadline;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Ids of the direct children of `parent`
    async fn child_ids(&self, parent: &Entity) -> PipelineResult<Vec<String>> {
        let field = match parent.kind {
            EntityKind::Product => fields::LINKED_PRODUCT,
            EntityKind::Material => fields::PARENT_MATERIAL,
        };
        let query =
            Query::new(EntityKind::Material.collection()).filter(Filter::eq(field, parent.reference().to_string()));
        Ok(self.state.query(query).await?.iter().map(|doc| doc.id().to_string()).collect())
    }

    /// Fetch the given materials in id batches and count those satisfying `pred`
    pub async fn count_satisfied(&self, ids: &[String], pred: impl Fn(&Entity) -> bool) -> PipelineResult<usize> {
        debug!(ids = ids.len(), batch = self.id_batch_size, "count_satisfied: called");
        let mut satisfied = 0;
        for chunk in ids.chunks(self.id_batch_size) {
            let query = Query::new(EntityKind::Material.collection()).filter(Filter::id_in(chunk));
            for doc in self.state.query(query).await? {
                if pred(&Entity::from_document(&doc)?) {
                    satisfied += 1;
                }
            }
        }
        Ok(satisfied)
    }

    /// One pass over the children of `parent`
    pub async fn check(&self, parent: &Entity, pred: impl Fn(&Entity) -> bool) -> PipelineResult<PollStatus> {
        debug!(parent = %parent.reference(), "check: called");
        let ids = self.child_ids(parent).await?;
        let satisfied = self.count_satisfied(&ids, pred).await?;
        let status = PollStatus {
            satisfied,
            total: ids.len(),
        };
        debug!(satisfied = status.satisfied, total = status.total, "check: done");
        Ok(status)
    }

    /// Block until every child satisfies `pred` or the deadline passes
    pub async fn wait_for_children(
        &self,
        parent: &DocRef,
        pred: impl Fn(&Entity) -> bool,
    ) -> PipelineResult<PollOutcome> {
        debug!(%parent, deadline_secs = self.deadline.as_secs(), "wait_for_children: called");
        // subscribe before the first check so no finish between the two is missed
        let mut rx = Some(self.events.subscribe());
        let entity = self.state.get_entity_required(parent).await?;
        let started = Instant::now();

        loop {
            let status = self.check(&entity, &pred).await?;
            if status.is_complete() {
                info!(%parent, total = status.total, "All children complete");
                return Ok(PollOutcome::Complete(status));
            }

            let elapsed = started.elapsed();
            if elapsed >= self.deadline {
                warn!(
                    %parent,
                    satisfied = status.satisfied,
                    total = status.total,
                    "Completion deadline passed, continuing best-effort"
                );
                return Ok(PollOutcome::TimedOut(status));
            }

            let nap = self.interval.min(self.deadline - elapsed);
            let mut bus_closed = false;
            match rx.as_mut() {
                Some(events) => {
                    tokio::select! {
                        _ = tokio::time::sleep(nap) => {
                            debug!("wait_for_children: interval elapsed");
                        }
                        woke = next_child_finished(events, parent) => {
                            bus_closed = !woke;
                        }
                    }
                }
                None => tokio::time::sleep(nap).await,
            }
            if bus_closed {
                debug!("wait_for_children: event bus closed, polling only");
                rx = None;
            }
        }
    }
}

/// Wait for a `ChildFinished` about `parent`. Returns false once the bus is closed.
async fn next_child_finished(rx: &mut broadcast::Receiver<PipelineEvent>, parent: &DocRef) -> bool {
    loop {
        match rx.recv().await {
            Ok(PipelineEvent::ChildFinished { parent: p, child }) if &p == parent => {
                debug!(%child, "next_child_finished: woke");
                return true;
            }
            Ok(_) => continue,
            // missed events might include ours; re-check
            Err(broadcast::error::RecvError::Lagged(_)) => return true,
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}
