//! Store error types

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::document::DocRef;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(DocRef),

    #[error("Document already exists: {0}")]
    AlreadyExists(DocRef),

    #[error("Transaction conflict on {0}")]
    Conflict(DocRef),

    #[error("Database busy")]
    Busy,

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid field path: {0}")]
    InvalidField(String),

    #[error("Field '{field}' on {reference} is not numeric")]
    NotNumeric { reference: DocRef, field: String },

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Check if the operation lost a race with another writer and may succeed if retried
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Busy)
    }

    /// Check if the error refers to a missing document
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::Busy
            }
            _ => StoreError::Database(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let reference = DocRef::new("materials", "m1");
        assert!(StoreError::Conflict(reference.clone()).is_conflict());
        assert!(StoreError::Busy.is_conflict());
        assert!(!StoreError::NotFound(reference.clone()).is_conflict());
        assert!(StoreError::NotFound(reference).is_not_found());
    }

    #[test]
    fn test_busy_maps_from_sqlite() {
        let err = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY), None);
        assert!(matches!(StoreError::from(err), StoreError::Busy));
    }
}
