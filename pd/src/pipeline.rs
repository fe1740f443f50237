//! Pipeline - wires the store, queue, dispatcher and stage handlers together

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::dispatch::{Dispatcher, StageContext};
use crate::domain::{Entity, StageName};
use crate::error::{PipelineError, PipelineResult};
use crate::events::EventBus;
use crate::llm::LlmClient;
use crate::poller::CompletionPoller;
use crate::prompts::PromptLoader;
use crate::propagation::{Propagator, conflict_policy};
use crate::queue::{Enqueued, QueueWorker, TaskQueue, TaskSpec, WorkerStats};
use crate::reasoning::ReasoningController;
use crate::retry::{Classifier, RetryPolicy};
use crate::stages;
use crate::state::StateManager;

/// Attempts for a commit that loses an optimistic race
const CONFLICT_ATTEMPTS: u32 = 8;

/// A node and its sub-materials, as stored
#[derive(Debug, Clone, Serialize)]
pub struct StatusNode {
    pub entity: Entity,
    pub children: Vec<StatusNode>,
}

impl StatusNode {
    /// Number of nodes in this subtree
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(StatusNode::size).sum::<usize>()
    }

    /// Sum of the nodes' own footprint outputs
    pub fn own_total(&self) -> f64 {
        let own = self.entity.cf_full.unwrap_or(0.0) + self.entity.transport_cf.unwrap_or(0.0);
        own + self.children.iter().map(StatusNode::own_total).sum::<f64>()
    }
}

pub struct Pipeline {
    config: Config,
    state: StateManager,
    events: EventBus,
    queue: TaskQueue,
    dispatcher: Arc<Dispatcher>,
}

impl Pipeline {
    pub fn new(config: Config, state: StateManager, llm: Arc<dyn LlmClient>) -> Self {
        Self::with_events(config, state, llm, EventBus::default())
    }

    pub fn with_events(config: Config, state: StateManager, llm: Arc<dyn LlmClient>, events: EventBus) -> Self {
        debug!("Pipeline::with_events: called");
        let retry = RetryPolicy::from_config(&config.retry);
        let prompts = Arc::new(PromptLoader::new(config.prompts.override_dir.clone()));
        let reasoning = ReasoningController::new(llm.clone(), prompts.clone(), config.reasoning.clone())
            .with_retry_policy(retry.clone());
        let poller = CompletionPoller::new(state.clone(), events.clone(), &config.poller);
        let queue = TaskQueue::new(state.clone(), events.clone(), &config.dispatch);
        let propagator = Propagator::new(state.clone(), events.clone(), conflict_policy(CONFLICT_ATTEMPTS));

        let ctx = Arc::new(StageContext {
            config: config.clone(),
            state: state.clone(),
            queue: queue.clone(),
            poller,
            llm,
            prompts,
            reasoning,
            retry,
            classifier: Classifier::standard(),
        });
        let dispatcher = Dispatcher::new(ctx, propagator, events.clone()).with_handlers(stages::all());

        Self {
            config,
            state,
            events,
            queue,
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// A worker draining this pipeline's queue
    pub fn worker(&self) -> QueueWorker {
        QueueWorker::new(self.queue.clone(), self.dispatcher.clone(), &self.config)
    }

    /// Create a product and enqueue its first stage
    pub async fn start(&self, name: &str, description: Option<&str>, mass_kg: Option<f64>) -> PipelineResult<Entity> {
        debug!(%name, "start: called");
        if name.trim().is_empty() {
            return Err(PipelineError::Validation("product name must not be empty".to_string()));
        }
        let mut product = Entity::product(name.trim());
        if let Some(description) = description {
            product = product.with_description(description);
        }
        if let Some(mass) = mass_kg {
            product = product.with_mass(mass);
        }
        self.state.create_entity(&product).await?;

        let enqueued = self
            .queue
            .enqueue(TaskSpec::new(StageName::ExpandMaterials, &product.id))
            .await?;
        if let Enqueued::Created(task) = &enqueued {
            info!(product_id = %product.id, task_id = %task.id, "Product started");
        }
        Ok(product)
    }

    /// Drain the queue in the foreground
    pub async fn run_until_idle(&self) -> PipelineResult<WorkerStats> {
        self.worker().run_until_idle().await
    }

    /// Load the tree rooted at a product or material id
    pub async fn status(&self, entity_id: &str) -> PipelineResult<StatusNode> {
        status_tree(&self.state, entity_id).await
    }
}

/// Load the tree rooted at a product or material id, children sorted by name
pub async fn status_tree(state: &StateManager, entity_id: &str) -> PipelineResult<StatusNode> {
    debug!(%entity_id, "status_tree: called");
    let root = state
        .find_entity(entity_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("entity {}", entity_id)))?;

    let mut children: HashMap<String, Vec<Entity>> = HashMap::new();
    let mut frontier = vec![root.clone()];
    while let Some(node) = frontier.pop() {
        let mut kids = state.children_of(&node).await?;
        kids.sort_by(|a, b| a.name.cmp(&b.name));
        frontier.extend(kids.iter().cloned());
        children.insert(node.id.clone(), kids);
    }
    Ok(build_tree(root, &mut children))
}

fn build_tree(entity: Entity, children: &mut HashMap<String, Vec<Entity>>) -> StatusNode {
    let kids = children.remove(&entity.id).unwrap_or_default();
    StatusNode {
        children: kids.into_iter().map(|kid| build_tree(kid, children)).collect(),
        entity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::MockLlmClient;

    fn pipeline() -> Pipeline {
        let state = StateManager::spawn_in_memory().unwrap();
        Pipeline::new(Config::default(), state, Arc::new(MockLlmClient::new(vec![])))
    }

    #[tokio::test]
    async fn test_start_creates_product_and_first_task() {
        let pipeline = pipeline();
        let product = pipeline.start("Desk Lamp", Some("a steel desk lamp"), Some(2.5)).await.unwrap();

        let stored = pipeline.state().find_entity(&product.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Desk Lamp");
        assert_eq!(stored.mass_kg, Some(2.5));

        let tasks = pipeline.queue().list(None).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].stage, StageName::ExpandMaterials);
        assert_eq!(tasks[0].entity_id, product.id);
    }

    #[tokio::test]
    async fn test_start_rejects_blank_name() {
        let pipeline = pipeline();
        let err = pipeline.start("  ", None, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_status_builds_tree() {
        let pipeline = pipeline();
        let product = Entity::product("Desk Lamp");
        let shade = Entity::material_of(&product, "Shade");
        let base = Entity::material_of(&product, "Base");
        let fabric = Entity::material_of(&shade, "Fabric");
        for entity in [&product, &shade, &base, &fabric] {
            pipeline.state().create_entity(entity).await.unwrap();
        }

        let tree = pipeline.status(&product.id).await.unwrap();
        assert_eq!(tree.size(), 4);
        let names: Vec<&str> = tree.children.iter().map(|c| c.entity.name.as_str()).collect();
        assert_eq!(names, vec!["Base", "Shade"]);
        assert_eq!(tree.children[1].children[0].entity.name, "Fabric");

        let err = pipeline.status("ghost").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }
}
