//! State manager messages
//!
//! Commands and responses for the actor pattern.

use entitystore::{DocRef, Document, Query, StoreError, WriteBatch};
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A precondition failed or the database was busy; the caller may retry
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Channel error")]
    ChannelError,
}

impl StateError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict(_))
    }
}

impl From<StoreError> for StateError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(reference) => StateError::NotFound(reference.to_string()),
            StoreError::Conflict(_) | StoreError::Busy => StateError::Conflict(e.to_string()),
            StoreError::Serialization(_) => StateError::DeserializationError(e.to_string()),
            other => StateError::StoreError(other.to_string()),
        }
    }
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    Get {
        reference: DocRef,
        reply: oneshot::Sender<StateResponse<Option<Document>>>,
    },
    Query {
        query: Query,
        reply: oneshot::Sender<StateResponse<Vec<Document>>>,
    },
    /// Apply a batch of writes atomically
    Commit {
        batch: WriteBatch,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    Collections {
        reply: oneshot::Sender<StateResponse<Vec<(String, usize)>>>,
    },

    // Shutdown
    Shutdown,
}
