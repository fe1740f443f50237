//! Dispatcher - runs one stage invocation end to end
//!
//! 1. Short-circuit duplicate deliveries and completed stages
//! 2. Check preconditions
//! 3. Run the handler
//! 4. Commit the stage status with its writes in one transaction
//! 5. Enqueue downstream stages from the routing table

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use super::context::StageContext;
use super::handler::{StageHandler, StageOutcome};
use super::invocation::{Invocation, StageInvoker, StageResponse};
use super::routing::{RouteInput, route};
use crate::domain::{Entity, StageName, StageStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::events::{EventBus, PipelineEvent};
use crate::propagation::Propagator;
use crate::queue::TaskSpec;

pub struct Dispatcher {
    ctx: Arc<StageContext>,
    propagator: Propagator,
    events: EventBus,
    handlers: HashMap<StageName, Arc<dyn StageHandler>>,
    trigger_retry_delay: Duration,
}

impl Dispatcher {
    pub fn new(ctx: Arc<StageContext>, propagator: Propagator, events: EventBus) -> Self {
        let trigger_retry_delay = Duration::from_millis(ctx.config.dispatch.trigger_retry_delay_ms);
        Self {
            ctx,
            propagator,
            events,
            handlers: HashMap::new(),
            trigger_retry_delay,
        }
    }

    /// Register a handler, replacing any previous one for its stage
    pub fn with_handler(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(handler.stage(), handler);
        self
    }

    pub fn with_handlers(self, handlers: impl IntoIterator<Item = Arc<dyn StageHandler>>) -> Self {
        handlers.into_iter().fold(self, Self::with_handler)
    }

    pub fn context(&self) -> &Arc<StageContext> {
        &self.ctx
    }

    pub async fn dispatch(&self, invocation: Invocation) -> PipelineResult<StageResponse> {
        debug!(
            stage = %invocation.stage,
            entity_id = %invocation.entity_id,
            delivery_count = invocation.delivery_count,
            attempt = invocation.attempt,
            "dispatch: called"
        );
        let stage = invocation.stage;
        let entity = self
            .ctx
            .state
            .find_entity(&invocation.entity_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("entity {}", invocation.entity_id)))?;
        let reference = entity.reference();

        let handler = self
            .handlers
            .get(&stage)
            .cloned()
            .ok_or_else(|| PipelineError::Validation(format!("no handler for stage {}", stage)))?;
        if !handler.applies_to(entity.kind) {
            return Err(PipelineError::Validation(format!(
                "stage {} does not apply to a {}",
                stage, entity.kind
            )));
        }

        let status = entity.stage_status(stage);
        if status.is_complete() {
            if invocation.attempt > 0 {
                // an earlier run committed but its triggers may not have landed
                debug!(%reference, %stage, "dispatch: re-entry of complete stage, re-running triggers");
                self.trigger(stage, &reference).await?;
            }
            return Ok(self.skip(&entity, stage, "already complete"));
        }
        if invocation.is_redelivery() && status == StageStatus::Started {
            return Ok(self.skip(&entity, stage, "duplicate delivery"));
        }

        let missing: Vec<&str> = handler
            .preconditions(entity.kind)
            .iter()
            .filter(|pre| !entity.is_stage_complete(**pre))
            .map(|pre| pre.as_str())
            .collect();
        if !missing.is_empty() {
            return Ok(self.skip(&entity, stage, &format!("waiting on {}", missing.join(", "))));
        }

        // the read above may be stale; a concurrent delivery can finish the stage meanwhile
        let Some(entity) = self.propagator.start_stage(&reference, stage).await? else {
            return Ok(self.skip(&entity, stage, "completed concurrently"));
        };
        self.events.emit(PipelineEvent::StageStarted {
            entity: reference.clone(),
            stage,
        });

        let (commit, result) = match handler.run(&self.ctx, &entity, &invocation).await {
            Ok(StageOutcome::Commit { commit, result }) => (commit, result),
            Ok(StageOutcome::Deferred { reason }) => {
                info!(%reference, %stage, %reason, "Stage deferred");
                return Ok(StageResponse::Done {
                    result: json!({ "deferred": reason }),
                });
            }
            Err(e) if e.is_transient() => {
                warn!(%reference, %stage, error = %e, "Stage degraded, committing without a result");
                let commit = handler.degraded(&self.ctx, &entity, &e);
                (commit, json!({ "degraded": e.to_string() }))
            }
            Err(e) => {
                warn!(%reference, %stage, error = %e, "Stage failed");
                return Err(e);
            }
        };

        let report = self.propagator.commit_stage(&reference, &commit).await?;
        if !report.applied {
            return Ok(self.skip(&entity, stage, "completed concurrently"));
        }
        let degraded = commit.status == StageStatus::Degraded;
        info!(%reference, %stage, degraded, delta = report.delta, "Stage completed");
        self.events.emit(PipelineEvent::StageCompleted {
            entity: reference.clone(),
            stage,
            degraded,
        });

        self.trigger(stage, &reference).await?;
        Ok(StageResponse::Done { result })
    }

    fn skip(&self, entity: &Entity, stage: StageName, reason: &str) -> StageResponse {
        info!(entity = %entity.reference(), %stage, %reason, "Stage skipped");
        self.events.emit(PipelineEvent::StageSkipped {
            entity: entity.reference(),
            stage,
            reason: reason.to_string(),
        });
        StageResponse::skipped(reason)
    }

    /// Enqueue downstream stages, with a single shallow retry
    async fn trigger(&self, stage: StageName, reference: &entitystore::DocRef) -> PipelineResult<usize> {
        debug!(%reference, %stage, "trigger: called");
        let specs = self.downstream(stage, reference).await?;
        if specs.is_empty() {
            return Ok(0);
        }

        let results = match self.ctx.queue.enqueue_all(specs.clone()).await {
            Ok(results) => results,
            Err(e) => {
                warn!(%reference, %stage, error = %e, "Trigger failed, retrying once");
                tokio::time::sleep(self.trigger_retry_delay).await;
                self.ctx.queue.enqueue_all(specs).await?
            }
        };
        let created = results.iter().filter(|r| r.is_created()).count();
        debug!(%reference, %stage, created, total = results.len(), "trigger: enqueued");
        Ok(created)
    }

    /// Read fresh state and consult the routing table
    async fn downstream(&self, stage: StageName, reference: &entitystore::DocRef) -> PipelineResult<Vec<TaskSpec>> {
        let entity = self.ctx.state.get_entity_required(reference).await?;
        let parent = match entity.parent() {
            Some(parent) => self.ctx.state.get_entity(parent).await?,
            None => None,
        };
        let children = if stage == StageName::ExpandMaterials {
            self.ctx.state.children_of(&entity).await?
        } else {
            Vec::new()
        };
        Ok(route(RouteInput {
            stage,
            entity: &entity,
            parent: parent.as_ref(),
            children: &children,
            max_tier: self.ctx.config.dispatch.max_tier,
        }))
    }
}

#[async_trait]
impl StageInvoker for Dispatcher {
    async fn invoke(&self, invocation: Invocation) -> PipelineResult<StageResponse> {
        self.dispatch(invocation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::domain::{EntityKind, Lifecycle, fields};
    use crate::llm::client::mock::MockLlmClient;
    use crate::poller::CompletionPoller;
    use crate::prompts::PromptLoader;
    use crate::propagation::{StageCommit, conflict_policy};
    use crate::queue::TaskQueue;
    use crate::reasoning::ReasoningController;
    use crate::retry::{Classifier, RetryPolicy};
    use crate::state::StateManager;
    use entitystore::Fields;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Behaviour = fn(&Entity) -> PipelineResult<StageOutcome>;

    /// Handler with canned behaviour that counts its runs
    struct TestHandler {
        stage: StageName,
        preconditions: &'static [StageName],
        behaviour: Behaviour,
        runs: AtomicUsize,
    }

    impl TestHandler {
        fn new(stage: StageName, behaviour: Behaviour) -> Arc<Self> {
            Self::with_preconditions(stage, &[], behaviour)
        }

        fn with_preconditions(stage: StageName, preconditions: &'static [StageName], behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                stage,
                preconditions,
                behaviour,
                runs: AtomicUsize::new(0),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StageHandler for TestHandler {
        fn stage(&self) -> StageName {
            self.stage
        }

        fn applies_to(&self, kind: EntityKind) -> bool {
            self.stage == StageName::ExpandMaterials || kind == EntityKind::Material
        }

        fn preconditions(&self, _kind: EntityKind) -> &'static [StageName] {
            self.preconditions
        }

        async fn run(&self, _ctx: &StageContext, entity: &Entity, _invocation: &Invocation) -> PipelineResult<StageOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            (self.behaviour)(entity)
        }
    }

    fn done(stage: StageName) -> PipelineResult<StageOutcome> {
        Ok(StageOutcome::commit(StageCommit::new(stage, StageStatus::Done), json!({})))
    }

    fn context(state: &StateManager, events: &EventBus) -> Arc<StageContext> {
        let config = Config::default();
        let llm: Arc<dyn crate::llm::LlmClient> = Arc::new(MockLlmClient::new(vec![]));
        let prompts = Arc::new(PromptLoader::embedded_only());
        Arc::new(StageContext {
            queue: TaskQueue::new(state.clone(), events.clone(), &config.dispatch),
            poller: CompletionPoller::new(state.clone(), events.clone(), &config.poller),
            reasoning: ReasoningController::new(llm.clone(), prompts.clone(), config.reasoning.clone()),
            state: state.clone(),
            llm,
            prompts,
            retry: RetryPolicy::immediate(1),
            classifier: Classifier::standard(),
            config,
        })
    }

    async fn setup(handlers: Vec<Arc<dyn StageHandler>>) -> (Dispatcher, StateManager, Entity, Entity) {
        let state = StateManager::spawn_in_memory().unwrap();
        let events = EventBus::default();
        let ctx = context(&state, &events);
        let propagator = Propagator::new(state.clone(), events.clone(), conflict_policy(3));
        let dispatcher = Dispatcher::new(ctx, propagator, events).with_handlers(handlers);

        let product = Entity::product("Desk Lamp");
        let shade = Entity::material_of(&product, "Shade");
        state.create_entity(&product).await.unwrap();
        state.create_entity(&shade).await.unwrap();
        (dispatcher, state, product, shade)
    }

    async fn set_status(state: &StateManager, entity: &Entity, stage: StageName, status: StageStatus) {
        let mut update = Fields::new();
        update.insert(fields::stage(stage), json!(status));
        state.update(entity.reference(), update).await.unwrap();
    }

    async fn queued_keys(dispatcher: &Dispatcher) -> Vec<String> {
        let mut keys: Vec<String> = dispatcher
            .context()
            .queue
            .list(None)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.key)
            .collect();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_dispatch_commits_and_triggers_downstream() {
        let handler = TestHandler::new(StageName::FootprintReview, |_| done(StageName::FootprintReview));
        let (dispatcher, state, _, shade) = setup(vec![handler.clone()]).await;

        let response = dispatcher
            .dispatch(Invocation::new(StageName::FootprintReview, &shade.id))
            .await
            .unwrap();
        assert!(!response.is_skipped());
        assert_eq!(handler.runs(), 1);

        let shade_now = state.get_entity_required(&shade.reference()).await.unwrap();
        assert_eq!(shade_now.stage_status(StageName::FootprintReview), StageStatus::Done);
        assert_eq!(shade_now.lifecycle, Lifecycle::Processing);
        assert_eq!(queued_keys(&dispatcher).await, vec![format!("uncertainty:{}", shade.id)]);
    }

    #[tokio::test]
    async fn test_expand_enqueues_children_and_own_check() {
        let handler = TestHandler::new(StageName::ExpandMaterials, |entity| {
            let mut commit = StageCommit::new(StageName::ExpandMaterials, StageStatus::Done);
            commit.lifecycle = Some(Lifecycle::AwaitingChildren);
            commit.children = vec![Entity::material_of(entity, "Bulb"), Entity::material_of(entity, "Cable")];
            Ok(StageOutcome::commit(commit, json!({})))
        });
        let (dispatcher, state, product, _) = setup(vec![handler]).await;

        dispatcher
            .dispatch(Invocation::new(StageName::ExpandMaterials, &product.id))
            .await
            .unwrap();

        let product_now = state.get_entity_required(&product.reference()).await.unwrap();
        assert_eq!(product_now.child_count, 2);
        assert_eq!(product_now.lifecycle, Lifecycle::AwaitingChildren);

        let keys = queued_keys(&dispatcher).await;
        assert_eq!(keys.len(), 4, "{:?}", keys);
        assert!(keys.contains(&format!("completion_check:{}", product.id)));
        assert_eq!(keys.iter().filter(|k| k.starts_with("supplier_finder:")).count(), 3);
    }

    #[tokio::test]
    async fn test_complete_stage_is_skipped_without_running() {
        let handler = TestHandler::new(StageName::FootprintReview, |_| done(StageName::FootprintReview));
        let (dispatcher, state, _, shade) = setup(vec![handler.clone()]).await;
        set_status(&state, &shade, StageName::FootprintReview, StageStatus::Done).await;

        let response = dispatcher
            .dispatch(Invocation::new(StageName::FootprintReview, &shade.id))
            .await
            .unwrap();
        assert_eq!(response, StageResponse::skipped("already complete"));
        assert_eq!(handler.runs(), 0);
        assert!(queued_keys(&dispatcher).await.is_empty());

        // a retried invocation re-runs the triggers
        let mut retry = Invocation::new(StageName::FootprintReview, &shade.id);
        retry.attempt = 1;
        dispatcher.dispatch(retry).await.unwrap();
        assert_eq!(handler.runs(), 0);
        assert_eq!(queued_keys(&dispatcher).await.len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_of_started_stage_is_skipped() {
        let handler = TestHandler::new(StageName::FootprintReview, |_| done(StageName::FootprintReview));
        let (dispatcher, state, _, shade) = setup(vec![handler.clone()]).await;
        set_status(&state, &shade, StageName::FootprintReview, StageStatus::Started).await;

        let mut redelivered = Invocation::new(StageName::FootprintReview, &shade.id);
        redelivered.delivery_count = 1;
        let response = dispatcher.dispatch(redelivered).await.unwrap();
        assert_eq!(response, StageResponse::skipped("duplicate delivery"));
        assert_eq!(handler.runs(), 0);

        // a first delivery of a started stage still runs
        dispatcher
            .dispatch(Invocation::new(StageName::FootprintReview, &shade.id))
            .await
            .unwrap();
        assert_eq!(handler.runs(), 1);
    }

    #[tokio::test]
    async fn test_missing_preconditions_skip() {
        let handler = TestHandler::with_preconditions(
            StageName::FootprintReview,
            &[StageName::MaterialFootprint, StageName::TransportFootprint],
            |_| done(StageName::FootprintReview),
        );
        let (dispatcher, state, _, shade) = setup(vec![handler.clone()]).await;
        set_status(&state, &shade, StageName::MaterialFootprint, StageStatus::Degraded).await;

        let response = dispatcher
            .dispatch(Invocation::new(StageName::FootprintReview, &shade.id))
            .await
            .unwrap();
        assert_eq!(response, StageResponse::skipped("waiting on transport_footprint"));
        assert_eq!(handler.runs(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_commits_degraded() {
        let handler = TestHandler::new(StageName::FootprintReview, |_| {
            Err(PipelineError::Exhausted {
                attempts: 10,
                last: "503".to_string(),
            })
        });
        let (dispatcher, state, _, shade) = setup(vec![handler]).await;

        let response = dispatcher
            .dispatch(Invocation::new(StageName::FootprintReview, &shade.id))
            .await
            .unwrap();
        assert!(matches!(response, StageResponse::Done { .. }));
        let shade_now = state.get_entity_required(&shade.reference()).await.unwrap();
        assert_eq!(shade_now.stage_status(StageName::FootprintReview), StageStatus::Degraded);
        // downstream still runs after a degraded stage
        assert_eq!(queued_keys(&dispatcher).await.len(), 1);
    }

    #[tokio::test]
    async fn test_internal_failure_propagates_and_leaves_stage_started() {
        let handler = TestHandler::new(StageName::FootprintReview, |_| {
            Err(PipelineError::Internal("bad answer".to_string()))
        });
        let (dispatcher, state, _, shade) = setup(vec![handler]).await;

        let err = dispatcher
            .dispatch(Invocation::new(StageName::FootprintReview, &shade.id))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 500);
        let shade_now = state.get_entity_required(&shade.reference()).await.unwrap();
        assert_eq!(shade_now.stage_status(StageName::FootprintReview), StageStatus::Started);
        assert!(queued_keys(&dispatcher).await.is_empty());
    }

    #[tokio::test]
    async fn test_deferred_outcome_leaves_stage_open() {
        let handler = TestHandler::new(StageName::CompletionCheck, |_| Ok(StageOutcome::deferred("1 of 2 children done")));
        let (dispatcher, state, _, shade) = setup(vec![handler]).await;

        let response = dispatcher
            .dispatch(Invocation::new(StageName::CompletionCheck, &shade.id))
            .await
            .unwrap();
        assert_eq!(
            response,
            StageResponse::Done {
                result: json!({"deferred": "1 of 2 children done"})
            }
        );
        let shade_now = state.get_entity_required(&shade.reference()).await.unwrap();
        assert_eq!(shade_now.stage_status(StageName::CompletionCheck), StageStatus::Started);
    }

    #[tokio::test]
    async fn test_unknown_entity_and_stage_are_rejected() {
        let handler = TestHandler::new(StageName::FootprintReview, |_| done(StageName::FootprintReview));
        let (dispatcher, _, product, shade) = setup(vec![handler]).await;

        let err = dispatcher
            .dispatch(Invocation::new(StageName::FootprintReview, "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));

        let err = dispatcher
            .dispatch(Invocation::new(StageName::Uncertainty, &shade.id))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let err = dispatcher
            .dispatch(Invocation::new(StageName::FootprintReview, &product.id))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    /// Commits on its first run; later runs either fail or commit again
    struct FirstWinsHandler {
        runs: AtomicUsize,
        fail_later: bool,
    }

    #[async_trait]
    impl StageHandler for FirstWinsHandler {
        fn stage(&self) -> StageName {
            StageName::FootprintReview
        }

        fn applies_to(&self, kind: EntityKind) -> bool {
            kind == EntityKind::Material
        }

        async fn run(&self, _ctx: &StageContext, _entity: &Entity, _invocation: &Invocation) -> PipelineResult<StageOutcome> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run > 0 && self.fail_later {
                return Err(PipelineError::Internal("late failure".to_string()));
            }
            done(StageName::FootprintReview)
        }
    }

    async fn race_once(fail_later: bool) -> (Entity, Entity) {
        let handler = Arc::new(FirstWinsHandler {
            runs: AtomicUsize::new(0),
            fail_later,
        });
        let (dispatcher, state, product, shade) = setup(vec![handler]).await;
        let dispatcher = Arc::new(dispatcher);

        let first = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let id = shade.id.clone();
            async move { dispatcher.dispatch(Invocation::new(StageName::FootprintReview, &id)).await }
        });
        let second = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let id = shade.id.clone();
            async move { dispatcher.dispatch(Invocation::new(StageName::FootprintReview, &id)).await }
        });
        // either run may fail; only the stored state matters
        let _ = first.await.unwrap();
        let _ = second.await.unwrap();

        let shade_now = state.get_entity_required(&shade.reference()).await.unwrap();
        let product_now = state.get_entity_required(&product.reference()).await.unwrap();
        (shade_now, product_now)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deliveries_never_clear_completion() {
        for _ in 0..100 {
            let (shade, _) = race_once(true).await;
            assert_eq!(shade.stage_status(StageName::FootprintReview), StageStatus::Done);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deliveries_commit_once() {
        for _ in 0..100 {
            let (shade, product) = race_once(false).await;
            assert_eq!(shade.stage_status(StageName::FootprintReview), StageStatus::Done);
            assert_eq!(product.child_progress.get(&StageName::FootprintReview), Some(&1));
        }
    }
}
