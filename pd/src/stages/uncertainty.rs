//! uncertainty - pedigree scores combined into an interval per footprint figure

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{describe, tag};
use crate::dispatch::{Ask, Invocation, StageContext, StageHandler, StageOutcome};
use crate::domain::{Artifact, ArtifactKind, Entity, EntityKind, Lifecycle, StageName, StageStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::propagation::StageCommit;
use crate::uncertainty::{MethodClass, QualityScores, UncertaintyRecord, assess};

pub struct Uncertainty;

impl Uncertainty {
    /// Figures on the entity and the method class each was produced by
    fn figures(entity: &Entity) -> Vec<(f64, MethodClass)> {
        [
            (entity.cf_full, MethodClass::Material),
            (entity.transport_cf, MethodClass::Transport),
        ]
        .into_iter()
        .filter_map(|(value, method)| value.map(|v| (v, method)))
        .collect()
    }

    fn base_commit(&self, entity: &Entity, status: StageStatus, max_tier: u32) -> StageCommit {
        let mut commit = StageCommit::new(self.stage(), status);
        // a leaf has no more work of its own once its uncertainty is known
        if !entity.is_expandable(max_tier) {
            commit.lifecycle = Some(Lifecycle::Done);
        }
        commit
    }

    fn build_commit(
        &self,
        entity: &Entity,
        records: &[UncertaintyRecord],
        status: StageStatus,
        max_tier: u32,
    ) -> PipelineResult<StageCommit> {
        let mut commit = self.base_commit(entity, status, max_tier);
        for record in records {
            commit.artifacts.push(Artifact::new(
                entity.reference(),
                self.stage(),
                ArtifactKind::Uncertainty,
                serde_json::to_value(record).map_err(|e| PipelineError::Internal(e.to_string()))?,
            ));
        }
        Ok(commit)
    }
}

fn summary(records: &[UncertaintyRecord]) -> Value {
    let items: Vec<Value> = records
        .iter()
        .map(|r| {
            json!({
                "method": r.method,
                "result": r.result,
                "total_ratio": r.total_ratio,
                "lower": r.lower,
                "upper": r.upper,
                "defaulted": r.defaulted.len(),
            })
        })
        .collect();
    json!({ "assessments": items })
}

#[async_trait]
impl StageHandler for Uncertainty {
    fn stage(&self) -> StageName {
        StageName::Uncertainty
    }

    fn applies_to(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Material
    }

    fn preconditions(&self, _kind: EntityKind) -> &'static [StageName] {
        &[StageName::FootprintReview]
    }

    async fn run(&self, ctx: &StageContext, entity: &Entity, _invocation: &Invocation) -> PipelineResult<StageOutcome> {
        debug!(entity_id = %entity.id, "Uncertainty::run: called");
        let tag = tag(self.stage(), entity);
        let mut records = Vec::new();

        for (value, method) in Self::figures(entity) {
            let mut context = describe(entity);
            context["result"] = json!(value);
            context["method"] = json!(method);
            let answer = ctx
                .ask::<QualityScores, _>(Ask {
                    tag: &tag,
                    template: "uncertainty",
                    context: &context,
                    schema_name: "pedigree_scores",
                    schema: QualityScores::schema(),
                    web_search: false,
                })
                .await?;
            if let Some(record) = assess(Some(value), &answer.value, method) {
                info!(
                    entity_id = %entity.id,
                    ?method,
                    total_ratio = record.total_ratio,
                    absolute = record.absolute,
                    "Uncertainty assessed"
                );
                records.push(record);
            }
        }

        let commit = self.build_commit(entity, &records, StageStatus::Done, ctx.config.dispatch.max_tier)?;
        Ok(StageOutcome::commit(commit, summary(&records)))
    }

    /// Every dimension falls back to its default score
    fn degraded(&self, ctx: &StageContext, entity: &Entity, error: &PipelineError) -> StageCommit {
        debug!(entity_id = %entity.id, %error, "Uncertainty::degraded: called");
        let records: Vec<UncertaintyRecord> = Self::figures(entity)
            .into_iter()
            .filter_map(|(value, method)| assess(Some(value), &QualityScores::default(), method))
            .collect();
        let max_tier = ctx.config.dispatch.max_tier;
        self.build_commit(entity, &records, StageStatus::Degraded, max_tier)
            .unwrap_or_else(|e| {
                warn!(entity_id = %entity.id, error = %e, "Uncertainty records not stored");
                self.base_commit(entity, StageStatus::Degraded, max_tier)
            })
    }
}
