//! StageHandler trait

use async_trait::async_trait;
use serde_json::Value;

use super::context::StageContext;
use super::invocation::Invocation;
use crate::domain::{Entity, EntityKind, StageName, StageStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::propagation::StageCommit;

/// What a handler produced
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// Finished; commit these writes together with the stage status
    Commit { commit: StageCommit, result: Value },
    /// Not finished yet; the handler arranged its own re-invocation
    Deferred { reason: String },
}

impl StageOutcome {
    pub fn commit(commit: StageCommit, result: Value) -> Self {
        Self::Commit { commit, result }
    }

    pub fn deferred(reason: impl Into<String>) -> Self {
        Self::Deferred { reason: reason.into() }
    }
}

/// One unit of pipeline work
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> StageName;

    fn applies_to(&self, _kind: EntityKind) -> bool {
        true
    }

    /// Stages that must be complete on the same entity first
    fn preconditions(&self, _kind: EntityKind) -> &'static [StageName] {
        &[]
    }

    async fn run(&self, ctx: &StageContext, entity: &Entity, invocation: &Invocation) -> PipelineResult<StageOutcome>;

    /// Writes for a run whose collaborators stayed unavailable past the retry budget
    fn degraded(&self, _ctx: &StageContext, _entity: &Entity, _error: &PipelineError) -> StageCommit {
        StageCommit::new(self.stage(), StageStatus::Degraded)
    }
}
