//! Pipeline error type
//!
//! Every failure that crosses a stage boundary is mapped onto one of these
//! categories; the category decides the response status and whether the
//! queue redelivers.

use thiserror::Error;

use crate::domain::TransitionError;
use crate::llm::LlmError;
use crate::reasoning::ParseError;
use crate::retry::{ErrorSignal, RetryError};
use crate::state::StateError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad input; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Retries exhausted after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: String },

    /// Lost an optimistic write race
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// HTTP-like status reported to the queue
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::Validation(_) => 400,
            PipelineError::NotFound(_) => 404,
            PipelineError::RateLimited(_) => 429,
            PipelineError::Unavailable(_) => 503,
            PipelineError::Exhausted { .. } => 503,
            PipelineError::Conflict(_) => 503,
            PipelineError::Internal(_) => 500,
        }
    }

    /// Client errors; redelivery cannot help
    pub fn is_fatal(&self) -> bool {
        (400..500).contains(&self.status_code()) && !self.is_rate_limit()
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, PipelineError::RateLimited(_))
    }

    /// Failures a later attempt may not repeat
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::RateLimited(_)
                | PipelineError::Unavailable(_)
                | PipelineError::Exhausted { .. }
                | PipelineError::Conflict(_)
        )
    }
}

impl ErrorSignal for PipelineError {
    fn status(&self) -> Option<u16> {
        Some(self.status_code())
    }

    fn code(&self) -> Option<&str> {
        match self {
            PipelineError::RateLimited(_) => Some("RESOURCE_EXHAUSTED"),
            PipelineError::Unavailable(_) => Some("UNAVAILABLE"),
            PipelineError::Conflict(_) => Some("ABORTED"),
            _ => None,
        }
    }

    fn message(&self) -> String {
        self.to_string()
    }
}

impl From<StateError> for PipelineError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(what) => PipelineError::NotFound(what),
            StateError::Conflict(what) => PipelineError::Conflict(what),
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

impl From<LlmError> for PipelineError {
    fn from(e: LlmError) -> Self {
        match &e {
            _ if e.is_rate_limit() => PipelineError::RateLimited(e.to_string()),
            LlmError::ApiError { status, .. } if *status >= 500 => PipelineError::Unavailable(e.to_string()),
            LlmError::Network(_) | LlmError::Timeout(_) => PipelineError::Unavailable(e.to_string()),
            LlmError::ApiError { status, .. } if (400..500).contains(status) => {
                PipelineError::Validation(e.to_string())
            }
            _ => PipelineError::Internal(e.to_string()),
        }
    }
}

impl From<ParseError> for PipelineError {
    fn from(e: ParseError) -> Self {
        PipelineError::Internal(e.to_string())
    }
}

impl From<TransitionError> for PipelineError {
    fn from(e: TransitionError) -> Self {
        PipelineError::Internal(e.to_string())
    }
}

impl From<entitystore::StoreError> for PipelineError {
    fn from(e: entitystore::StoreError) -> Self {
        StateError::from(e).into()
    }
}

impl<E: std::fmt::Display + Into<PipelineError>> From<RetryError<E>> for PipelineError {
    fn from(e: RetryError<E>) -> Self {
        match e {
            RetryError::Fatal(inner) => inner.into(),
            RetryError::Exhausted { attempts, last } => PipelineError::Exhausted {
                attempts,
                last: last.to_string(),
            },
        }
    }
}
