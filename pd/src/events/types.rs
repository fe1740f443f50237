//! Event types for pipeline activity

use chrono::{DateTime, Utc};
use entitystore::DocRef;
use serde::{Deserialize, Serialize};

use crate::domain::StageName;

/// Observable pipeline activity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    StageStarted {
        entity: DocRef,
        stage: StageName,
    },
    StageCompleted {
        entity: DocRef,
        stage: StageName,
        degraded: bool,
    },
    StageSkipped {
        entity: DocRef,
        stage: StageName,
        reason: String,
    },
    /// A delta was applied to a node and all its ancestors
    DeltaApplied {
        entity: DocRef,
        delta: f64,
        ancestors: usize,
    },
    /// A child finished its own work; the parent may be complete now
    ChildFinished {
        parent: DocRef,
        child: DocRef,
    },
    EntityDone {
        entity: DocRef,
    },
    TaskFailed {
        task_id: String,
        key: String,
        error: String,
    },
}

impl PipelineEvent {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::StageStarted { .. } => "StageStarted",
            PipelineEvent::StageCompleted { .. } => "StageCompleted",
            PipelineEvent::StageSkipped { .. } => "StageSkipped",
            PipelineEvent::DeltaApplied { .. } => "DeltaApplied",
            PipelineEvent::ChildFinished { .. } => "ChildFinished",
            PipelineEvent::EntityDone { .. } => "EntityDone",
            PipelineEvent::TaskFailed { .. } => "TaskFailed",
        }
    }

    /// The document the event is about, if any
    pub fn entity(&self) -> Option<&DocRef> {
        match self {
            PipelineEvent::StageStarted { entity, .. }
            | PipelineEvent::StageCompleted { entity, .. }
            | PipelineEvent::StageSkipped { entity, .. }
            | PipelineEvent::DeltaApplied { entity, .. }
            | PipelineEvent::EntityDone { entity } => Some(entity),
            PipelineEvent::ChildFinished { parent, .. } => Some(parent),
            PipelineEvent::TaskFailed { .. } => None,
        }
    }
}

/// A timestamped event as written to the journal
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: PipelineEvent,
}

impl EventLogEntry {
    pub fn new(event: PipelineEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}
