//! footprintd - pipeline orchestration for aggregate footprint metrics
//!
//! A product is expanded into a tree of materials. Every node runs a fixed
//! set of stages (supplier identification, footprint estimates, a review,
//! an uncertainty pass) as tasks on a durable queue, and every change to a
//! node's footprint is propagated atomically to all of its ancestors.
//!
//! # Modules
//!
//! - [`retry`] - Retry/backoff executor and error classification
//! - [`fanout`] - Concurrent batches with failure tracking across rounds
//! - [`poller`] - Completion barrier over a node's children
//! - [`propagation`] - Stage commits and ancestor aggregation
//! - [`reasoning`] - Multi-round reasoning loop with verification
//! - [`uncertainty`] - Pedigree-score uncertainty combiner
//! - [`queue`] - Durable task queue with dependencies and leases
//! - [`dispatch`] - Stage dispatcher and routing table
//! - [`stages`] - The stage handlers
//! - [`pipeline`] - Wiring for all of the above

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod events;
pub mod fanout;
pub mod llm;
pub mod pipeline;
pub mod poller;
pub mod prompts;
pub mod propagation;
pub mod queue;
pub mod reasoning;
pub mod retry;
pub mod stages;
pub mod state;
pub mod uncertainty;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{Dispatcher, Invocation, StageContext, StageHandler, StageInvoker, StageResponse};
pub use domain::{Artifact, ArtifactKind, Entity, EntityKind, Lifecycle, StageName, StageStatus};
pub use error::{PipelineError, PipelineResult};
pub use events::{EventBus, PipelineEvent};
pub use llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError};
pub use pipeline::{Pipeline, StatusNode};
pub use queue::{QueueWorker, Task, TaskQueue, TaskSpec, TaskStatus};
pub use state::StateManager;
