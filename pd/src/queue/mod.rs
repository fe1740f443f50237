//! Durable task queue with dependency edges
//!
//! Downstream stages are persisted as tasks instead of fire-and-forget calls,
//! so a failed stage leaves a resumable record behind.

mod queue;
mod task;
mod worker;

pub use queue::{Dedupe, Dep, Enqueued, TaskQueue, TaskSpec};
pub use task::{Task, TaskStatus, task_key};
pub use worker::{QueueWorker, WorkerStats};
