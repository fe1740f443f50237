//! supplier_finder - identify the most likely supplier through the reasoning loop

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::tag;
use crate::dispatch::{Invocation, StageContext, StageHandler, StageOutcome};
use crate::domain::{Artifact, ArtifactKind, Entity, EntityKind, StageName, StageStatus, fields};
use crate::error::{PipelineError, PipelineResult};
use crate::propagation::StageCommit;
use crate::reasoning::{ReasoningTask, Resolution};

pub struct SupplierFinder;

impl SupplierFinder {
    fn task(entity: &Entity, invocation: &Invocation) -> ReasoningTask {
        let question = format!(
            "Which company most likely supplies the {} used in this product?",
            entity.name
        );
        let mut context = vec![format!("Material: {}", entity.name)];
        if let Some(description) = &entity.description {
            context.push(format!("Description: {}", description));
        }
        if let Some(mass) = entity.mass_kg {
            context.push(format!("Mass: {} kg", mass));
        }
        if let Some(hint) = invocation.params.get("hint").and_then(|h| h.as_str()) {
            context.push(format!("Hint: {}", hint));
        }
        ReasoningTask::new(tag(StageName::SupplierFinder, entity), question, context.join("\n"))
    }
}

#[async_trait]
impl StageHandler for SupplierFinder {
    fn stage(&self) -> StageName {
        StageName::SupplierFinder
    }

    fn applies_to(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Material
    }

    async fn run(&self, ctx: &StageContext, entity: &Entity, invocation: &Invocation) -> PipelineResult<StageOutcome> {
        debug!(entity_id = %entity.id, "SupplierFinder::run: called");
        let outcome = ctx.reasoning.run(&Self::task(entity, invocation)).await?;

        // a failed loop still completes the stage, with a null supplier
        let status = if outcome.is_failed() {
            StageStatus::Degraded
        } else {
            StageStatus::Done
        };
        let supplier = outcome.primary.as_ref().map(|p| p.candidate.label.clone());
        let alternatives: Vec<String> = outcome
            .alternatives
            .iter()
            .map(|a| a.candidate.label.clone())
            .collect();
        info!(
            entity_id = %entity.id,
            resolution = ?outcome.resolution,
            supplier = supplier.as_deref().unwrap_or("-"),
            "Supplier search finished"
        );

        let mut commit = StageCommit::new(self.stage(), status);
        commit.fields.insert(fields::SUPPLIER_NAME.to_string(), json!(supplier));
        commit.fields.insert(
            fields::SUPPLIER_ESTIMATED.to_string(),
            json!(outcome.resolution == Resolution::Estimated),
        );
        commit.fields.insert(fields::SUPPLIER_ALTERNATIVES.to_string(), json!(alternatives));

        if !outcome.sources.is_empty() {
            commit.artifacts.push(Artifact::new(
                entity.reference(),
                self.stage(),
                ArtifactKind::Sources,
                serde_json::to_value(&outcome.sources).map_err(|e| PipelineError::Internal(e.to_string()))?,
            ));
        }
        commit.artifacts.push(Artifact::new(
            entity.reference(),
            self.stage(),
            ArtifactKind::Transcript,
            json!({
                "resolution": outcome.resolution,
                "direct_attempts": outcome.direct_attempts,
                "verify_attempts": outcome.verify_attempts,
                "estimate_attempts": outcome.estimate_attempts,
                "usage": outcome.usage,
                "transcript": outcome.transcript,
            }),
        ));

        let result = json!({
            "resolution": outcome.resolution,
            "supplier": supplier,
            "alternatives": alternatives,
        });
        Ok(StageOutcome::commit(commit, result))
    }
}
