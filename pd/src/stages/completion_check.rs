//! completion_check - close a node once all of its children are done
//!
//! A check that finds unfinished children re-enqueues itself with a delay and
//! defers. The last child to finish pulls the queued check forward, so the
//! delay is only a fallback. Past the deadline the node closes degraded.

use std::time::Duration;

use async_trait::async_trait;
use entitystore::{Fields, now_ms};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::dispatch::{Invocation, StageContext, StageHandler, StageOutcome};
use crate::domain::{Entity, EntityKind, Lifecycle, StageName, StageStatus, fields};
use crate::error::{PipelineError, PipelineResult};
use crate::poller::{PollStatus, child_done};
use crate::propagation::StageCommit;

pub struct CompletionCheck;

impl CompletionCheck {
    fn close(&self, started_at: i64, status: StageStatus) -> StageCommit {
        let mut commit = StageCommit::new(self.stage(), status);
        commit.lifecycle = Some(Lifecycle::Done);
        commit
            .fields
            .insert(fields::COMPLETION_STARTED_AT.to_string(), json!(started_at));
        commit
    }

    fn result(poll: PollStatus, waited_ms: i64) -> serde_json::Value {
        json!({
            "satisfied": poll.satisfied,
            "total": poll.total,
            "waited_ms": waited_ms,
        })
    }
}

#[async_trait]
impl StageHandler for CompletionCheck {
    fn stage(&self) -> StageName {
        StageName::CompletionCheck
    }

    fn preconditions(&self, _kind: EntityKind) -> &'static [StageName] {
        &[StageName::ExpandMaterials]
    }

    async fn run(&self, ctx: &StageContext, entity: &Entity, _invocation: &Invocation) -> PipelineResult<StageOutcome> {
        debug!(entity_id = %entity.id, "CompletionCheck::run: called");
        let now = now_ms();
        let started_at = entity.completion_started_at.unwrap_or(now);
        let waited_ms = now.saturating_sub(started_at);

        let poll = ctx.poller.check(entity, child_done).await?;
        if poll.is_complete() {
            info!(entity_id = %entity.id, total = poll.total, waited_ms, "All children done");
            return Ok(StageOutcome::commit(
                self.close(started_at, StageStatus::Done),
                Self::result(poll, waited_ms),
            ));
        }

        let deadline_ms = i64::try_from(ctx.poller.deadline().as_millis()).unwrap_or(i64::MAX);
        if waited_ms >= deadline_ms {
            warn!(
                entity_id = %entity.id,
                satisfied = poll.satisfied,
                total = poll.total,
                "Completion deadline passed, closing with unfinished children"
            );
            return Ok(StageOutcome::commit(
                self.close(started_at, StageStatus::Degraded),
                Self::result(poll, waited_ms),
            ));
        }

        if entity.completion_started_at.is_none() {
            let mut update = Fields::new();
            update.insert(fields::COMPLETION_STARTED_AT.to_string(), json!(started_at));
            ctx.state.update(entity.reference(), update).await?;
        }
        let delay = Duration::from_secs(ctx.config.poller.reschedule_delay_secs);
        ctx.queue.enqueue_delayed(self.stage(), &entity.id, delay).await?;
        debug!(
            entity_id = %entity.id,
            satisfied = poll.satisfied,
            total = poll.total,
            delay_secs = delay.as_secs(),
            "CompletionCheck::run: rescheduled"
        );
        Ok(StageOutcome::deferred(format!(
            "{} of {} children done",
            poll.satisfied, poll.total
        )))
    }

    /// The node still closes; its counters stay as they are
    fn degraded(&self, _ctx: &StageContext, entity: &Entity, error: &PipelineError) -> StageCommit {
        debug!(entity_id = %entity.id, %error, "CompletionCheck::degraded: called");
        self.close(entity.completion_started_at.unwrap_or_else(now_ms), StageStatus::Degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_finishes_lifecycle() {
        let commit = CompletionCheck.close(42, StageStatus::Degraded);
        assert_eq!(commit.stage, StageName::CompletionCheck);
        assert_eq!(commit.status, StageStatus::Degraded);
        assert_eq!(commit.lifecycle, Some(Lifecycle::Done));
        assert_eq!(commit.fields.get(fields::COMPLETION_STARTED_AT), Some(&json!(42)));
    }
}
