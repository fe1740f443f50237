//! Pipeline events
//!
//! An in-process broadcast bus plus an optional JSONL journal. The bus is a
//! latency optimization for waiters such as the completion poller; durable
//! state always lives in the store.

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use logger::{EventLogger, JOURNAL_FILE, read_journal, spawn_event_logger};
pub use types::{EventLogEntry, PipelineEvent};
