//! material_footprint and transport_footprint - per-material emission figures

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{describe, tag};
use crate::dispatch::{Ask, Invocation, StageContext, StageHandler, StageOutcome};
use crate::domain::{Artifact, ArtifactKind, Entity, EntityKind, StageName, StageOutput, StageStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::propagation::StageCommit;

/// One leg of a transport route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintLeg {
    pub mode: String,
    #[serde(default)]
    pub distance_km: Option<f64>,
    pub kg_co2e: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintAnswer {
    pub kg_co2e: f64,
    #[serde(default)]
    pub legs: Vec<FootprintLeg>,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl FootprintAnswer {
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "kg_co2e": {"type": "number"},
                "legs": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "mode": {"type": "string"},
                            "distance_km": {"type": ["number", "null"]},
                            "kg_co2e": {"type": "number"}
                        },
                        "required": ["mode", "distance_km", "kg_co2e"],
                        "additionalProperties": false
                    }
                },
                "rationale": {"type": ["string", "null"]}
            },
            "required": ["kg_co2e", "legs", "rationale"],
            "additionalProperties": false
        })
    }

    /// Emission figures are non-negative and finite
    pub fn validate(&self) -> Result<(), String> {
        let valid = |v: f64| v.is_finite() && v >= 0.0;
        if !valid(self.kg_co2e) {
            return Err(format!("implausible footprint {}", self.kg_co2e));
        }
        if let Some(leg) = self.legs.iter().find(|leg| !valid(leg.kg_co2e)) {
            return Err(format!("implausible {} leg {}", leg.mode, leg.kg_co2e));
        }
        Ok(())
    }
}

/// Shared body of both footprint stages
async fn estimate(
    stage: StageName,
    output: StageOutput,
    transport: bool,
    ctx: &StageContext,
    entity: &Entity,
) -> PipelineResult<StageOutcome> {
    let mut context = describe(entity);
    context["transport"] = json!(transport);
    let tag = tag(stage, entity);
    let answer = ctx
        .ask::<FootprintAnswer, _>(Ask {
            tag: &tag,
            template: "footprint",
            context: &context,
            schema_name: "footprint",
            schema: FootprintAnswer::schema(),
            web_search: true,
        })
        .await?;

    let footprint = answer.value;
    footprint
        .validate()
        .map_err(|e| PipelineError::Internal(format!("{} for {}: {}", stage, entity.id, e)))?;
    info!(entity_id = %entity.id, %stage, kg_co2e = footprint.kg_co2e, "Footprint estimated");

    let mut commit = StageCommit::new(stage, StageStatus::Done);
    commit.outputs.insert(output, footprint.kg_co2e);
    for leg in &footprint.legs {
        commit.artifacts.push(Artifact::new(
            entity.reference(),
            stage,
            ArtifactKind::Leg,
            serde_json::to_value(leg).map_err(|e| PipelineError::Internal(e.to_string()))?,
        ));
    }
    if !answer.response.grounding_sources.is_empty() {
        commit.artifacts.push(Artifact::new(
            entity.reference(),
            stage,
            ArtifactKind::Sources,
            serde_json::to_value(&answer.response.grounding_sources)
                .map_err(|e| PipelineError::Internal(e.to_string()))?,
        ));
    }

    let result = json!({
        output.field(): footprint.kg_co2e,
        "legs": footprint.legs.len(),
        "rationale": footprint.rationale,
    });
    Ok(StageOutcome::commit(commit, result))
}

pub struct MaterialFootprint;

#[async_trait]
impl StageHandler for MaterialFootprint {
    fn stage(&self) -> StageName {
        StageName::MaterialFootprint
    }

    fn applies_to(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Material
    }

    fn preconditions(&self, _kind: EntityKind) -> &'static [StageName] {
        &[StageName::SupplierFinder]
    }

    async fn run(&self, ctx: &StageContext, entity: &Entity, _invocation: &Invocation) -> PipelineResult<StageOutcome> {
        debug!(entity_id = %entity.id, "MaterialFootprint::run: called");
        estimate(self.stage(), StageOutput::CfFull, false, ctx, entity).await
    }
}

pub struct TransportFootprint;

#[async_trait]
impl StageHandler for TransportFootprint {
    fn stage(&self) -> StageName {
        StageName::TransportFootprint
    }

    fn applies_to(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Material
    }

    fn preconditions(&self, _kind: EntityKind) -> &'static [StageName] {
        &[StageName::SupplierFinder]
    }

    async fn run(&self, ctx: &StageContext, entity: &Entity, _invocation: &Invocation) -> PipelineResult<StageOutcome> {
        debug!(entity_id = %entity.id, "TransportFootprint::run: called");
        estimate(self.stage(), StageOutput::TransportCf, true, ctx, entity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(kg: f64, legs: &[f64]) -> FootprintAnswer {
        FootprintAnswer {
            kg_co2e: kg,
            legs: legs
                .iter()
                .map(|kg| FootprintLeg {
                    mode: "truck".into(),
                    distance_km: Some(100.0),
                    kg_co2e: *kg,
                })
                .collect(),
            rationale: None,
        }
    }

    #[test]
    fn test_validate_rejects_implausible_values() {
        assert!(answer(1.5, &[0.5, 1.0]).validate().is_ok());
        assert!(answer(-1.0, &[]).validate().is_err());
        assert!(answer(f64::NAN, &[]).validate().is_err());
        assert!(answer(1.0, &[f64::INFINITY]).validate().unwrap_err().contains("truck"));
    }

    #[test]
    fn test_answer_decodes_without_optional_parts() {
        let parsed: FootprintAnswer = serde_json::from_str(r#"{"kg_co2e": 3.2}"#).unwrap();
        assert_eq!(parsed.kg_co2e, 3.2);
        assert!(parsed.legs.is_empty());
    }
}
