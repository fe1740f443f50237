//! footprint_review - sanity pass that may correct earlier footprint figures

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{describe, tag};
use crate::dispatch::{Ask, Invocation, StageContext, StageHandler, StageOutcome};
use crate::domain::{Entity, EntityKind, StageName, StageOutput, StageStatus};
use crate::error::PipelineResult;
use crate::propagation::StageCommit;

/// Corrected figures; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewAnswer {
    pub cf_full: Option<f64>,
    pub transport_cf: Option<f64>,
    pub rationale: Option<String>,
}

impl ReviewAnswer {
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "cf_full": {"type": ["number", "null"]},
                "transport_cf": {"type": ["number", "null"]},
                "rationale": {"type": ["string", "null"]}
            },
            "required": ["cf_full", "transport_cf", "rationale"],
            "additionalProperties": false
        })
    }

    fn correction(&self, output: StageOutput) -> Option<f64> {
        match output {
            StageOutput::CfFull => self.cf_full,
            StageOutput::TransportCf => self.transport_cf,
        }
    }

    /// Outputs that actually change; implausible corrections are ignored
    pub fn corrections(&self, entity: &Entity) -> Vec<(StageOutput, f64)> {
        [StageOutput::CfFull, StageOutput::TransportCf]
            .into_iter()
            .filter_map(|output| {
                let value = self.correction(output)?;
                let plausible = value.is_finite() && value >= 0.0;
                (plausible && entity.output(output) != Some(value)).then_some((output, value))
            })
            .collect()
    }
}

pub struct FootprintReview;

#[async_trait]
impl StageHandler for FootprintReview {
    fn stage(&self) -> StageName {
        StageName::FootprintReview
    }

    fn applies_to(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Material
    }

    fn preconditions(&self, _kind: EntityKind) -> &'static [StageName] {
        &[StageName::MaterialFootprint, StageName::TransportFootprint]
    }

    async fn run(&self, ctx: &StageContext, entity: &Entity, _invocation: &Invocation) -> PipelineResult<StageOutcome> {
        debug!(entity_id = %entity.id, "FootprintReview::run: called");
        let mut context = describe(entity);
        context["cf_full"] = json!(entity.cf_full);
        context["transport_cf"] = json!(entity.transport_cf);

        let tag = tag(self.stage(), entity);
        let answer = ctx
            .ask::<ReviewAnswer, _>(Ask {
                tag: &tag,
                template: "review",
                context: &context,
                schema_name: "footprint_review",
                schema: ReviewAnswer::schema(),
                web_search: false,
            })
            .await?;

        let review = answer.value;
        let corrections = review.corrections(entity);
        let mut commit = StageCommit::new(self.stage(), StageStatus::Done);
        for (output, value) in &corrections {
            info!(entity_id = %entity.id, field = output.field(), old = ?entity.output(*output), new = value, "Footprint corrected");
            commit.outputs.insert(*output, *value);
        }

        let corrected: Vec<&str> = corrections.iter().map(|(output, _)| output.field()).collect();
        let result = json!({ "corrected": corrected, "rationale": review.rationale });
        Ok(StageOutcome::commit(commit, result))
    }
}
