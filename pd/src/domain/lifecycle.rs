//! Explicit state machines for entities and their stages
//!
//! Both machines are persisted as a single named-state field and only move
//! along the edges listed in their transition tables.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {machine} transition: {from} -> {to}")]
pub struct TransitionError {
    pub machine: &'static str,
    pub from: String,
    pub to: String,
}

/// Lifecycle of an entity node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Created,
    Processing,
    /// Own work finished, children still running
    AwaitingChildren,
    Done,
}

impl Lifecycle {
    const TRANSITIONS: &'static [(Lifecycle, Lifecycle)] = &[
        (Lifecycle::Created, Lifecycle::Processing),
        (Lifecycle::Created, Lifecycle::AwaitingChildren),
        (Lifecycle::Created, Lifecycle::Done),
        (Lifecycle::Processing, Lifecycle::AwaitingChildren),
        (Lifecycle::Processing, Lifecycle::Done),
        (Lifecycle::AwaitingChildren, Lifecycle::Done),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Processing => "processing",
            Self::AwaitingChildren => "awaiting_children",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == Self::Done
    }

    /// Staying in the same state is always allowed
    pub fn can_transition_to(&self, next: Lifecycle) -> bool {
        *self == next || Self::TRANSITIONS.contains(&(*self, next))
    }

    pub fn transition(self, next: Lifecycle) -> Result<Lifecycle, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                machine: "lifecycle",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of one stage on one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Started,
    Done,
    /// Completed with a null or partial result after its retries ran out
    Degraded,
}

impl StageStatus {
    const TRANSITIONS: &'static [(StageStatus, StageStatus)] = &[
        (StageStatus::Pending, StageStatus::Started),
        (StageStatus::Pending, StageStatus::Done),
        (StageStatus::Pending, StageStatus::Degraded),
        (StageStatus::Started, StageStatus::Started),
        (StageStatus::Started, StageStatus::Done),
        (StageStatus::Started, StageStatus::Degraded),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Done => "done",
            Self::Degraded => "degraded",
        }
    }

    /// Completed stages are never re-run and never reset
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Done | Self::Degraded)
    }

    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        Self::TRANSITIONS.contains(&(*self, next))
    }

    pub fn transition(self, next: StageStatus) -> Result<StageStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                machine: "stage",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
