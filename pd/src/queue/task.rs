//! Durable task records

use entitystore::{DocRef, Document, Fields, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{StageName, TransitionError};

/// Status of a queued stage invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    /// Parked after its attempts ran out or a fatal error; resumable
    Failed,
}

impl TaskStatus {
    const TRANSITIONS: &'static [(TaskStatus, TaskStatus)] = &[
        (TaskStatus::Queued, TaskStatus::Running),
        (TaskStatus::Running, TaskStatus::Succeeded),
        (TaskStatus::Running, TaskStatus::Failed),
        (TaskStatus::Running, TaskStatus::Queued),
        (TaskStatus::Failed, TaskStatus::Queued),
    ];

    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        Self::TRANSITIONS.contains(&(*self, next))
    }

    pub fn transition(self, next: TaskStatus) -> Result<TaskStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                machine: "task",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Unknown task status: {}", s))
    }
}

/// Key that identifies "this stage on this entity"
pub fn task_key(stage: StageName, entity_id: &str) -> String {
    format!("{}:{}", stage, entity_id)
}

/// A persisted stage invocation in the `tasks` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub key: String,
    pub stage: StageName,
    pub entity_id: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub status: TaskStatus,
    /// Task ids that must succeed before this one is claimable
    #[serde(default)]
    pub deps: Vec<String>,
    /// Unix ms before which the task is not claimable
    pub run_at: i64,
    /// Claims so far, including the running one
    #[serde(default)]
    pub attempts: u32,
    /// Times the task was handed out again after a lease expired
    #[serde(default)]
    pub delivery_count: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub lease_until: Option<i64>,
    /// Higher runs first among ready tasks
    #[serde(default)]
    pub priority: i32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub const COLLECTION: &'static str = "tasks";

    pub fn new(stage: StageName, entity_id: impl Into<String>, max_attempts: u32) -> Self {
        let entity_id = entity_id.into();
        let now = entitystore::now_ms();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            key: task_key(stage, &entity_id),
            stage,
            entity_id,
            params: Value::Null,
            status: TaskStatus::Queued,
            deps: Vec::new(),
            run_at: now,
            attempts: 0,
            delivery_count: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            lease_until: None,
            priority: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn reference(&self) -> DocRef {
        DocRef::new(Self::COLLECTION, self.id.clone())
    }

    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        doc.decode()
    }

    pub fn to_fields(&self) -> Result<Fields, StoreError> {
        entitystore::to_fields(self)
    }

    pub fn attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Lease ran out while the task was running
    pub fn lease_expired(&self, now: i64) -> bool {
        self.status == TaskStatus::Running && self.lease_until.is_some_and(|until| until <= now)
    }
}
