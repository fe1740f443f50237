//! Aggregation and propagation engine
//!
//! The aggregate `estimated_cf` is only ever moved by signed deltas, applied
//! to a node and every ancestor in its `pm_chain` inside one transaction.
//! Stage outputs drive those deltas as `new - old` against the persisted
//! output, so repeated corrections never compound.

use std::collections::BTreeMap;
use std::time::Duration;

use entitystore::{DocRef, Fields};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::domain::{Artifact, Entity, Lifecycle, StageName, StageOutput, StageStatus, fields};
use crate::error::{PipelineError, PipelineResult};
use crate::events::{EventBus, PipelineEvent};
use crate::retry::{Classifier, RetryPolicy, code_in, execute_with_retry};
use crate::state::{StateManager, Transaction};

/// Everything a finished stage writes, committed as one unit
#[derive(Debug, Clone)]
pub struct StageCommit {
    pub stage: StageName,
    /// `Done` or `Degraded`
    pub status: StageStatus,
    /// New stage-output values; each change feeds the aggregate delta
    pub outputs: BTreeMap<StageOutput, f64>,
    /// Plain field overwrites on the node
    pub fields: Fields,
    pub lifecycle: Option<Lifecycle>,
    pub artifacts: Vec<Artifact>,
    pub children: Vec<Entity>,
}

impl StageCommit {
    pub fn new(stage: StageName, status: StageStatus) -> Self {
        Self {
            stage,
            status,
            outputs: BTreeMap::new(),
            fields: Fields::new(),
            lifecycle: None,
            artifacts: Vec::new(),
            children: Vec::new(),
        }
    }
}

/// What a commit did
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaReport {
    /// False when the stage was already complete and nothing was written
    pub applied: bool,
    pub delta: f64,
    /// Ancestors the delta reached
    pub ancestors: usize,
    pub lifecycle: Lifecycle,
    pub parent: Option<DocRef>,
    /// The node reached `Done` in this commit
    pub finished: bool,
}

/// Retry shape for lost optimistic races: quick, since the winner already committed
pub fn conflict_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(2),
        jitter: Duration::from_millis(50),
    }
}

#[derive(Clone)]
pub struct Propagator {
    state: StateManager,
    events: EventBus,
    policy: RetryPolicy,
    classifier: Classifier,
}

impl Propagator {
    pub fn new(state: StateManager, events: EventBus, policy: RetryPolicy) -> Self {
        Self {
            state,
            events,
            policy,
            classifier: Classifier::empty().with("conflict", code_in(&["ABORTED"])),
        }
    }

    /// Add `delta` to the node and all its ancestors atomically. Returns the ancestor count.
    pub async fn apply_delta(&self, node: &DocRef, delta: f64) -> PipelineResult<usize> {
        debug!(%node, delta, "apply_delta: called");
        if !delta.is_finite() {
            return Err(PipelineError::Validation(format!("non-finite delta {} for {}", delta, node)));
        }
        let ancestors = execute_with_retry(|| self.try_apply_delta(node, delta), &self.policy, &self.classifier).await?;
        self.events.emit(PipelineEvent::DeltaApplied {
            entity: node.clone(),
            delta,
            ancestors,
        });
        Ok(ancestors)
    }

    async fn try_apply_delta(&self, node: &DocRef, delta: f64) -> PipelineResult<usize> {
        // pm_chain never changes, so the read needs no version pin
        let entity = self.state.get_entity_required(node).await?;
        let mut tx = Transaction::begin(&self.state);
        increment_chain(&mut tx, &entity, delta);
        tx.commit().await?;
        Ok(entity.pm_chain.len())
    }

    /// Commit a finished stage: outputs, propagated delta, status, lifecycle,
    /// parent counters, artifacts and children, all or nothing.
    pub async fn commit_stage(&self, node: &DocRef, commit: &StageCommit) -> PipelineResult<DeltaReport> {
        debug!(%node, stage = %commit.stage, status = %commit.status, "commit_stage: called");
        let report = execute_with_retry(
            || self.try_commit_stage(node, commit),
            &self.policy,
            &self.classifier,
        )
        .await?;

        if report.applied {
            if report.delta != 0.0 {
                self.events.emit(PipelineEvent::DeltaApplied {
                    entity: node.clone(),
                    delta: report.delta,
                    ancestors: report.ancestors,
                });
            }
            if report.finished {
                info!(%node, "Entity done");
                self.events.emit(PipelineEvent::EntityDone { entity: node.clone() });
                if let Some(parent) = &report.parent {
                    self.events.emit(PipelineEvent::ChildFinished {
                        parent: parent.clone(),
                        child: node.clone(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Move a stage to `Started` against a fresh, version-pinned read.
    /// Returns `None` when the stage is already complete and nothing was written.
    pub async fn start_stage(&self, node: &DocRef, stage: StageName) -> PipelineResult<Option<Entity>> {
        debug!(%node, %stage, "start_stage: called");
        let started = execute_with_retry(|| self.try_start_stage(node, stage), &self.policy, &self.classifier).await?;
        Ok(started)
    }

    async fn try_start_stage(&self, node: &DocRef, stage: StageName) -> PipelineResult<Option<Entity>> {
        let mut tx = Transaction::begin(&self.state);
        let mut entity = Entity::from_document(&tx.get_required(node).await?)?;
        if entity.is_stage_complete(stage) {
            debug!(%node, %stage, "start_stage: already complete, writing nothing");
            return Ok(None);
        }

        let status = entity.stage_status(stage).transition(StageStatus::Started)?;
        let mut update = Fields::new();
        update.insert(fields::stage(stage), json!(status));
        if entity.lifecycle == Lifecycle::Created {
            let lifecycle = entity.lifecycle.transition(Lifecycle::Processing)?;
            update.insert(fields::LIFECYCLE.to_string(), json!(lifecycle));
            entity.lifecycle = lifecycle;
        }
        tx.update(node.clone(), update);
        tx.commit().await?;

        entity.stages.insert(stage, status);
        Ok(Some(entity))
    }

    async fn try_commit_stage(&self, node: &DocRef, commit: &StageCommit) -> PipelineResult<DeltaReport> {
        let mut tx = Transaction::begin(&self.state);
        let entity = Entity::from_document(&tx.get_required(node).await?)?;
        let parent = entity.parent().cloned();

        if entity.is_stage_complete(commit.stage) {
            debug!(%node, stage = %commit.stage, "commit_stage: already complete, writing nothing");
            return Ok(DeltaReport {
                applied: false,
                delta: 0.0,
                ancestors: entity.pm_chain.len(),
                lifecycle: entity.lifecycle,
                parent,
                finished: false,
            });
        }

        let status = entity.stage_status(commit.stage).transition(commit.status)?;
        let mut update = commit.fields.clone();
        update.insert(fields::stage(commit.stage), json!(status));

        let mut delta = 0.0;
        for (output, value) in &commit.outputs {
            if !value.is_finite() {
                return Err(PipelineError::Validation(format!("non-finite {} for {}", output.field(), node)));
            }
            delta += value - entity.output(*output).unwrap_or(0.0);
            update.insert(output.field().to_string(), json!(value));
        }

        let lifecycle = match commit.lifecycle {
            Some(next) => entity.lifecycle.transition(next)?,
            None => entity.lifecycle,
        };
        let finished = lifecycle == Lifecycle::Done && entity.lifecycle != Lifecycle::Done;
        update.insert(fields::LIFECYCLE.to_string(), json!(lifecycle));

        if !commit.children.is_empty() {
            update.insert(
                fields::CHILD_COUNT.to_string(),
                Value::from(entity.child_count + commit.children.len() as u64),
            );
        }

        tx.update(node.clone(), update);
        increment_chain(&mut tx, &entity, delta);

        if let Some(parent) = &parent {
            tx.increment(parent.clone(), &fields::child_progress(commit.stage), 1.0);
            if finished {
                tx.increment(parent.clone(), fields::CHILDREN_DONE, 1.0);
            }
        }
        for artifact in &commit.artifacts {
            tx.create(artifact.reference(), entitystore::to_fields(artifact)?);
        }
        for child in &commit.children {
            tx.create(child.reference(), child.to_fields()?);
        }

        debug!(%node, delta, writes = tx.write_count(), "commit_stage: committing");
        tx.commit().await?;

        Ok(DeltaReport {
            applied: true,
            delta,
            ancestors: entity.pm_chain.len(),
            lifecycle,
            parent,
            finished,
        })
    }
}

fn increment_chain(tx: &mut Transaction, entity: &Entity, delta: f64) {
    if delta == 0.0 {
        return;
    }
    tx.increment(entity.reference(), fields::ESTIMATED_CF, delta);
    for link in &entity.pm_chain {
        tx.increment(link.reference(), fields::ESTIMATED_CF, delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ArtifactKind;
    use proptest::prelude::*;

    async fn setup() -> (StateManager, Propagator, Entity, Entity, Entity) {
        let state = StateManager::spawn_in_memory().unwrap();
        let propagator = Propagator::new(state.clone(), EventBus::default(), RetryPolicy::immediate(5));
        let product = Entity::product("Desk Lamp");
        let shade = Entity::material_of(&product, "Shade");
        let fabric = Entity::material_of(&shade, "Fabric");
        for entity in [&product, &shade, &fabric] {
            state.create_entity(entity).await.unwrap();
        }
        (state, propagator, product, shade, fabric)
    }

    async fn cf(state: &StateManager, entity: &Entity) -> f64 {
        state.get_entity_required(&entity.reference()).await.unwrap().estimated_cf
    }

    fn output(stage: StageName, value: f64) -> StageCommit {
        let mut commit = StageCommit::new(stage, StageStatus::Done);
        commit.outputs.insert(StageOutput::CfFull, value);
        commit
    }

    #[tokio::test]
    async fn test_apply_delta_reaches_ancestors() {
        let (state, propagator, product, shade, fabric) = setup().await;
        let ancestors = propagator.apply_delta(&fabric.reference(), 4.0).await.unwrap();
        assert_eq!(ancestors, 2);
        assert_eq!(cf(&state, &fabric).await, 4.0);
        assert_eq!(cf(&state, &shade).await, 4.0);
        assert_eq!(cf(&state, &product).await, 4.0);

        propagator.apply_delta(&shade.reference(), -1.5).await.unwrap();
        assert_eq!(cf(&state, &fabric).await, 4.0);
        assert_eq!(cf(&state, &shade).await, 2.5);
        assert_eq!(cf(&state, &product).await, 2.5);
    }

    #[tokio::test]
    async fn test_correction_scenario_ten_then_seven() {
        let (state, propagator, product, shade, _) = setup().await;

        let report = propagator
            .commit_stage(&shade.reference(), &output(StageName::MaterialFootprint, 10.0))
            .await
            .unwrap();
        assert_eq!(report.delta, 10.0);

        let report = propagator
            .commit_stage(&shade.reference(), &output(StageName::FootprintReview, 7.0))
            .await
            .unwrap();
        assert_eq!(report.delta, -3.0);

        assert_eq!(cf(&state, &shade).await, 7.0);
        assert_eq!(cf(&state, &product).await, 7.0);
        let shade = state.get_entity_required(&shade.reference()).await.unwrap();
        assert_eq!(shade.cf_full, Some(7.0));
    }

    #[tokio::test]
    async fn test_start_stage_moves_created_to_processing() {
        let (state, propagator, _, shade, _) = setup().await;
        let started = propagator
            .start_stage(&shade.reference(), StageName::SupplierFinder)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started.stage_status(StageName::SupplierFinder), StageStatus::Started);
        assert_eq!(started.lifecycle, Lifecycle::Processing);

        let stored = state.get_entity_required(&shade.reference()).await.unwrap();
        assert_eq!(stored.stage_status(StageName::SupplierFinder), StageStatus::Started);
        assert_eq!(stored.lifecycle, Lifecycle::Processing);
    }

    #[tokio::test]
    async fn test_start_stage_leaves_complete_stage_alone() {
        let (state, propagator, _, shade, _) = setup().await;
        propagator
            .commit_stage(&shade.reference(), &output(StageName::MaterialFootprint, 3.0))
            .await
            .unwrap();
        let before = state.get(&shade.reference()).await.unwrap().unwrap().version;

        let started = propagator
            .start_stage(&shade.reference(), StageName::MaterialFootprint)
            .await
            .unwrap();
        assert!(started.is_none());
        let after = state.get_entity_required(&shade.reference()).await.unwrap();
        assert_eq!(after.stage_status(StageName::MaterialFootprint), StageStatus::Done);
        assert_eq!(state.get(&shade.reference()).await.unwrap().unwrap().version, before);
    }

    #[tokio::test]
    async fn test_completed_stage_writes_nothing() {
        let (state, propagator, product, shade, _) = setup().await;
        let commit = output(StageName::MaterialFootprint, 10.0);
        propagator.commit_stage(&shade.reference(), &commit).await.unwrap();
        let before = state.get_required(&shade.reference()).await.unwrap().version;
        let parent_before = state.get_required(&product.reference()).await.unwrap().version;

        let report = propagator.commit_stage(&shade.reference(), &commit).await.unwrap();
        assert!(!report.applied);
        assert_eq!(state.get_required(&shade.reference()).await.unwrap().version, before);
        assert_eq!(state.get_required(&product.reference()).await.unwrap().version, parent_before);
        assert_eq!(cf(&state, &product).await, 10.0);
    }

    #[tokio::test]
    async fn test_commit_updates_parent_counters_and_lifecycle() {
        let (state, propagator, product, shade, _) = setup().await;
        let mut commit = StageCommit::new(StageName::Uncertainty, StageStatus::Degraded);
        commit.lifecycle = Some(Lifecycle::Done);
        commit.artifacts.push(Artifact::new(
            shade.reference(),
            StageName::Uncertainty,
            ArtifactKind::Uncertainty,
            json!({"total_ratio": 2.0}),
        ));

        let report = propagator.commit_stage(&shade.reference(), &commit).await.unwrap();
        assert!(report.finished);
        assert_eq!(report.parent, Some(product.reference()));

        let shade = state.get_entity_required(&shade.reference()).await.unwrap();
        assert_eq!(shade.lifecycle, Lifecycle::Done);
        assert_eq!(shade.stage_status(StageName::Uncertainty), StageStatus::Degraded);

        let product = state.get_entity_required(&product.reference()).await.unwrap();
        assert_eq!(product.children_done, 1);
        assert_eq!(product.child_progress.get(&StageName::Uncertainty), Some(&1));
        assert_eq!(state.artifacts_for(&shade.reference()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_children_created_with_parent_commit() {
        let (state, propagator, product, _, _) = setup().await;
        let reloaded = state.get_entity_required(&product.reference()).await.unwrap();
        let mut commit = StageCommit::new(StageName::ExpandMaterials, StageStatus::Done);
        commit.children = vec![
            Entity::material_of(&reloaded, "Base"),
            Entity::material_of(&reloaded, "Cable"),
        ];
        commit.lifecycle = Some(Lifecycle::AwaitingChildren);
        propagator.commit_stage(&product.reference(), &commit).await.unwrap();

        let product = state.get_entity_required(&product.reference()).await.unwrap();
        // one child from setup plus two new ones
        assert_eq!(product.child_count, 2);
        assert_eq!(state.children_of(&product).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected_without_writes() {
        let (state, propagator, _, shade, _) = setup().await;
        let mut done = StageCommit::new(StageName::Uncertainty, StageStatus::Done);
        done.lifecycle = Some(Lifecycle::Done);
        propagator.commit_stage(&shade.reference(), &done).await.unwrap();

        let mut back = output(StageName::MaterialFootprint, 5.0);
        back.lifecycle = Some(Lifecycle::Processing);
        assert!(propagator.commit_stage(&shade.reference(), &back).await.is_err());
        assert_eq!(cf(&state, &shade).await, 0.0);
    }

    #[tokio::test]
    async fn test_missing_node_is_not_found() {
        let (_, propagator, _, _, _) = setup().await;
        let err = propagator
            .apply_delta(&DocRef::new("materials", "ghost"), 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_deltas_all_land() {
        let (state, propagator, product, shade, fabric) = setup().await;
        let mut handles = Vec::new();
        for i in 0..10 {
            let propagator = propagator.clone();
            let node = if i % 2 == 0 { fabric.reference() } else { shade.reference() };
            handles.push(tokio::spawn(async move { propagator.apply_delta(&node, 1.0).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(cf(&state, &fabric).await, 5.0);
        assert_eq!(cf(&state, &shade).await, 10.0);
        assert_eq!(cf(&state, &product).await, 10.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_conservation(deltas in proptest::collection::vec((0usize..3, -100i32..100), 1..20)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let (state, propagator, product, shade, fabric) = setup().await;
                let nodes = [&product, &shade, &fabric];
                let mut own = [0.0f64; 3];
                for (idx, delta) in &deltas {
                    propagator.apply_delta(&nodes[*idx].reference(), *delta as f64).await.unwrap();
                    own[*idx] += *delta as f64;
                }
                // each node holds its own deltas plus every descendant's
                let expected = [own[0] + own[1] + own[2], own[1] + own[2], own[2]];
                for (node, want) in nodes.iter().zip(expected) {
                    let got = cf(&state, node).await;
                    assert!((got - want).abs() < 1e-9, "{}: {} != {}", node.name, got, want);
                }
            });
        }
    }
}
