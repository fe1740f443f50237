//! expand_materials - bill of materials for a product or an intermediate material

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{describe, tag};
use crate::dispatch::{Ask, Invocation, StageContext, StageHandler, StageOutcome};
use crate::domain::{Artifact, ArtifactKind, Entity, EntityKind, Lifecycle, StageName, StageStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::propagation::StageCommit;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BomItem {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mass_kg: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bom {
    #[serde(default)]
    pub items: Vec<BomItem>,
}

impl Bom {
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "description": {"type": ["string", "null"]},
                            "mass_kg": {"type": ["number", "null"]}
                        },
                        "required": ["name", "description", "mass_kg"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["items"],
            "additionalProperties": false
        })
    }

    /// Children for `parent`: blank names dropped, duplicates merged, at most `limit`
    pub fn into_children(self, parent: &Entity, limit: usize) -> Vec<Entity> {
        let mut seen = std::collections::HashSet::new();
        self.items
            .into_iter()
            .filter(|item| {
                let name = item.name.trim().to_lowercase();
                !name.is_empty() && seen.insert(name)
            })
            .take(limit)
            .map(|item| {
                let mut child = Entity::material_of(parent, item.name.trim());
                child.description = item.description.filter(|d| !d.trim().is_empty());
                child.mass_kg = item.mass_kg.filter(|m| m.is_finite() && *m >= 0.0);
                child
            })
            .collect()
    }
}

pub struct ExpandMaterials;

#[async_trait]
impl StageHandler for ExpandMaterials {
    fn stage(&self) -> StageName {
        StageName::ExpandMaterials
    }

    fn preconditions(&self, kind: EntityKind) -> &'static [StageName] {
        match kind {
            EntityKind::Product => &[],
            EntityKind::Material => &[StageName::Uncertainty],
        }
    }

    async fn run(&self, ctx: &StageContext, entity: &Entity, _invocation: &Invocation) -> PipelineResult<StageOutcome> {
        debug!(entity_id = %entity.id, "ExpandMaterials::run: called");
        let max_items = ctx.config.dispatch.max_bom_items;
        let mut context = describe(entity);
        context["max_items"] = json!(max_items);

        let tag = tag(self.stage(), entity);
        let answer = ctx
            .ask::<Bom, _>(Ask {
                tag: &tag,
                template: "bom",
                context: &context,
                schema_name: "bill_of_materials",
                schema: Bom::schema(),
                web_search: false,
            })
            .await?;

        let bom = answer.value;
        let children = bom.clone().into_children(entity, max_items);
        info!(entity_id = %entity.id, children = children.len(), "Expanded bill of materials");

        let mut commit = StageCommit::new(self.stage(), StageStatus::Done);
        commit.lifecycle = Some(Lifecycle::AwaitingChildren);
        commit.artifacts.push(Artifact::new(
            entity.reference(),
            self.stage(),
            ArtifactKind::Bom,
            serde_json::to_value(&bom).map_err(|e| PipelineError::Internal(e.to_string()))?,
        ));
        let names: Vec<&str> = children.iter().map(|c| c.name.as_str()).collect();
        let result = json!({ "children": names });
        commit.children = children;
        Ok(StageOutcome::commit(commit, result))
    }

    /// No children; the completion check closes the node right away
    fn degraded(&self, _ctx: &StageContext, _entity: &Entity, _error: &PipelineError) -> StageCommit {
        let mut commit = StageCommit::new(self.stage(), StageStatus::Degraded);
        commit.lifecycle = Some(Lifecycle::AwaitingChildren);
        commit
    }
}
