//! Append-only stage artifacts

use entitystore::DocRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StageName;

/// What an artifact records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Grounding sources behind an answer
    Sources,
    /// Prompts and answers of a reasoning loop
    Transcript,
    /// A per-leg sub-result (e.g. one transport leg)
    Leg,
    /// Inputs and output of the uncertainty combiner
    Uncertainty,
    /// Bill of materials returned by an expansion
    Bom,
}

/// Write-once sub-record attached to an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub entity: DocRef,
    pub stage: StageName,
    pub kind: ArtifactKind,
    pub payload: Value,
    pub created_at: i64,
}

impl Artifact {
    pub const COLLECTION: &'static str = "artifacts";

    pub fn new(entity: DocRef, stage: StageName, kind: ArtifactKind, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            entity,
            stage,
            kind,
            payload,
            created_at: entitystore::now_ms(),
        }
    }

    pub fn reference(&self) -> DocRef {
        DocRef::new(Self::COLLECTION, self.id.clone())
    }
}
