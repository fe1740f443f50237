//! Stage invocation payloads and the invoker seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::StageName;
use crate::error::PipelineResult;
use crate::queue::Task;

/// Call-by-name request for one stage on one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub stage: StageName,
    pub entity_id: String,
    #[serde(default)]
    pub params: Value,
    /// Non-zero when the transport handed this invocation out again
    #[serde(default)]
    pub delivery_count: u32,
    /// Zero-based re-entry count after failed runs
    #[serde(default)]
    pub attempt: u32,
}

impl Invocation {
    pub fn new(stage: StageName, entity_id: impl Into<String>) -> Self {
        Self {
            stage,
            entity_id: entity_id.into(),
            params: Value::Null,
            delivery_count: 0,
            attempt: 0,
        }
    }

    /// Invocation for a claimed task
    pub fn from_task(task: &Task) -> Self {
        Self {
            stage: task.stage,
            entity_id: task.entity_id.clone(),
            params: task.params.clone(),
            delivery_count: task.delivery_count,
            attempt: task.attempts.saturating_sub(1),
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 0
    }
}

/// Successful stage response (the 2xx family)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageResponse {
    Done { result: Value },
    /// Accepted without doing work
    Skipped { reason: String },
}

impl StageResponse {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped { reason: reason.into() }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// Remote stage invocation: call a stage by name with a JSON payload
#[async_trait]
pub trait StageInvoker: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> PipelineResult<StageResponse>;
}
