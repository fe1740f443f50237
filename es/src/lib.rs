//! EntityStore - versioned JSON documents over SQLite
//!
//! Documents live in named collections and are addressed by [`DocRef`]
//! (`collection/id`). Writes are grouped into [`WriteBatch`]es that commit
//! atomically and can carry optimistic version preconditions, which is what
//! higher layers build multi-document transactions on.

pub mod batch;
pub mod document;
pub mod error;
pub mod query;
pub mod store;

pub use batch::{Precondition, Write, WriteBatch};
pub use document::{DocRef, Document, Fields, get_path, to_fields};
pub use error::{Result, StoreError};
pub use query::{Filter, FilterOp, ID_FIELD, MAX_IN_VALUES, Order, Query};
pub use store::Store;

/// Current time as unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
