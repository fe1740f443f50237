//! State management with actor pattern
//!
//! StateManager owns the entity store and processes messages via channels,
//! providing shared async access to persistent state. Multi-document
//! read-modify-write goes through [`Transaction`].

mod manager;
mod messages;
mod transaction;

pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateResponse};
pub use transaction::Transaction;
