//! TaskQueue - durable DAG of stage invocations
//!
//! Tasks are documents in the `tasks` collection. A task becomes claimable
//! once its `run_at` has passed and every dependency succeeded. Claiming
//! takes a lease; a lease that runs out hands the task out again with a
//! higher `delivery_count`.

use std::collections::HashMap;
use std::time::Duration;

use entitystore::{DocRef, Filter, FilterOp, Order, Query, WriteBatch};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::task::{Task, TaskStatus, task_key};
use crate::config::DispatchConfig;
use crate::domain::{StageName, TransitionError};
use crate::error::{PipelineError, PipelineResult};
use crate::events::{EventBus, PipelineEvent};
use crate::state::{StateManager, Transaction};

/// A dependency of a spec in the same `enqueue_all` call, or of an existing task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dep {
    Local(usize),
    Task(String),
}

/// How to treat an existing task with the same key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dedupe {
    /// Always enqueue
    #[default]
    None,
    /// Reuse a queued task only, pulling it forward. A running one may be
    /// about to re-enqueue itself with a delay, so it does not count.
    Queued,
    /// Reuse any task with the key, whatever its status
    Any,
}

/// Request to enqueue one stage invocation
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub stage: StageName,
    pub entity_id: String,
    pub params: Value,
    pub delay: Duration,
    pub priority: i32,
    pub deps: Vec<Dep>,
    pub dedupe: Dedupe,
}

impl TaskSpec {
    pub fn new(stage: StageName, entity_id: impl Into<String>) -> Self {
        Self {
            stage,
            entity_id: entity_id.into(),
            params: Value::Null,
            delay: Duration::ZERO,
            priority: 0,
            deps: Vec::new(),
            dedupe: Dedupe::None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Run only after spec `index` of the same batch succeeded
    pub fn after(mut self, index: usize) -> Self {
        self.deps.push(Dep::Local(index));
        self
    }

    pub fn after_task(mut self, task_id: impl Into<String>) -> Self {
        self.deps.push(Dep::Task(task_id.into()));
        self
    }

    pub fn dedupe(mut self, dedupe: Dedupe) -> Self {
        self.dedupe = dedupe;
        self
    }

    pub fn key(&self) -> String {
        task_key(self.stage, &self.entity_id)
    }
}

/// Result of enqueueing one spec
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Created(Task),
    /// Deduplicated onto an existing task
    Existing(String),
}

impl Enqueued {
    pub fn id(&self) -> &str {
        match self {
            Enqueued::Created(task) => &task.id,
            Enqueued::Existing(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Enqueued::Created(_))
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    state: StateManager,
    events: EventBus,
    max_attempts: u32,
    retry_delay: Duration,
    lease: Duration,
}

impl TaskQueue {
    pub fn new(state: StateManager, events: EventBus, config: &DispatchConfig) -> Self {
        Self {
            state,
            events,
            max_attempts: config.task_max_attempts,
            retry_delay: Duration::from_millis(config.task_retry_delay_ms),
            lease: Duration::from_secs(config.lease_secs),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub async fn enqueue(&self, spec: TaskSpec) -> PipelineResult<Enqueued> {
        debug!(stage = %spec.stage, entity_id = %spec.entity_id, "enqueue: called");
        let mut results = self.enqueue_all(vec![spec]).await?;
        results
            .pop()
            .ok_or_else(|| PipelineError::Internal("enqueue produced no result".to_string()))
    }

    /// Enqueue a delayed invocation; never deduplicated
    pub async fn enqueue_delayed(
        &self,
        stage: StageName,
        entity_id: &str,
        delay: Duration,
    ) -> PipelineResult<Enqueued> {
        debug!(%stage, %entity_id, delay_secs = delay.as_secs(), "enqueue_delayed: called");
        self.enqueue(TaskSpec::new(stage, entity_id).delayed(delay)).await
    }

    /// Enqueue a group of specs in one batch. `Dep::Local` indexes must point
    /// at earlier specs. Deduplication is best-effort: two racing callers can
    /// both create a task for the same key, which the stage guard absorbs.
    pub async fn enqueue_all(&self, specs: Vec<TaskSpec>) -> PipelineResult<Vec<Enqueued>> {
        debug!(count = specs.len(), "enqueue_all: called");
        let now = entitystore::now_ms();
        let mut batch = WriteBatch::new();
        let mut results: Vec<Enqueued> = Vec::with_capacity(specs.len());
        let mut batch_keys: HashMap<String, String> = HashMap::new();

        for (index, spec) in specs.into_iter().enumerate() {
            let run_at = now + spec.delay.as_millis() as i64;
            let key = spec.key();

            if spec.dedupe != Dedupe::None {
                if let Some(id) = batch_keys.get(&key) {
                    results.push(Enqueued::Existing(id.clone()));
                    continue;
                }
                if let Some(existing) = self.find_reusable(&key, spec.dedupe).await? {
                    if existing.status == TaskStatus::Queued && existing.run_at > run_at {
                        debug!(task_id = %existing.id, "enqueue_all: pulling queued task forward");
                        batch.update(existing.reference(), fields(json!({"run_at": run_at, "updated_at": now})));
                    }
                    debug!(%key, task_id = %existing.id, "enqueue_all: deduplicated");
                    batch_keys.insert(key, existing.id.clone());
                    results.push(Enqueued::Existing(existing.id));
                    continue;
                }
            }

            let mut task = Task::new(spec.stage, spec.entity_id, self.max_attempts);
            task.params = spec.params;
            task.run_at = run_at;
            task.priority = spec.priority;
            for dep in spec.deps {
                let id = match dep {
                    Dep::Task(id) => id,
                    Dep::Local(i) if i < index => results[i].id().to_string(),
                    Dep::Local(i) => {
                        return Err(PipelineError::Validation(format!(
                            "task spec {} depends on later spec {}",
                            index, i
                        )));
                    }
                };
                task.deps.push(id);
            }

            batch.create(task.reference(), task.to_fields()?);
            batch_keys.insert(key, task.id.clone());
            results.push(Enqueued::Created(task));
        }

        self.state.commit(batch).await?;
        let created = results.iter().filter(|r| r.is_created()).count();
        debug!(created, total = results.len(), "enqueue_all: committed");
        Ok(results)
    }

    async fn find_reusable(&self, key: &str, dedupe: Dedupe) -> PipelineResult<Option<Task>> {
        let docs = self
            .state
            .query(Query::new(Task::COLLECTION).filter(Filter::eq("key", key)))
            .await?;
        for doc in docs {
            let task = Task::from_document(&doc)?;
            let reusable = match dedupe {
                Dedupe::None => false,
                Dedupe::Queued => task.status == TaskStatus::Queued,
                Dedupe::Any => true,
            };
            if reusable {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    pub async fn get(&self, task_id: &str) -> PipelineResult<Option<Task>> {
        debug!(%task_id, "get: called");
        match self.state.get(&DocRef::new(Task::COLLECTION, task_id)).await? {
            Some(doc) => Ok(Some(Task::from_document(&doc)?)),
            None => Ok(None),
        }
    }

    /// Claim up to `limit` ready tasks, highest priority first
    pub async fn claim_ready(&self, limit: usize) -> PipelineResult<Vec<Task>> {
        debug!(limit, "claim_ready: called");
        let now = entitystore::now_ms();
        self.recover_expired(now).await?;

        let query = Query::new(Task::COLLECTION)
            .filter(Filter::eq("status", TaskStatus::Queued.as_str()))
            .filter(Filter {
                field: "run_at".to_string(),
                op: FilterOp::Lte,
                value: json!(now),
            });
        let mut ready = Vec::new();
        for doc in self.state.query(query).await? {
            ready.push(Task::from_document(&doc)?);
        }

        let statuses = self.dep_statuses(&ready).await?;
        ready.retain(|task| {
            task.deps.iter().all(|dep| match statuses.get(dep) {
                Some(status) => *status == TaskStatus::Succeeded,
                None => {
                    warn!(task_id = %task.id, %dep, "Dependency missing, treating as satisfied");
                    true
                }
            })
        });
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.run_at.cmp(&b.run_at))
                .then(a.created_at.cmp(&b.created_at))
        });

        let lease_until = now + self.lease.as_millis() as i64;
        let mut claimed = Vec::new();
        for task in ready {
            if claimed.len() >= limit {
                break;
            }
            let result = self
                .modify(&task.id, |task| {
                    if task.status != TaskStatus::Queued {
                        return Ok(false);
                    }
                    task.status = task.status.transition(TaskStatus::Running)?;
                    task.attempts += 1;
                    task.lease_until = Some(lease_until);
                    Ok(true)
                })
                .await;
            match result {
                Ok(Some(task)) => claimed.push(task),
                // another worker got there first
                Ok(None) | Err(PipelineError::Conflict(_)) => {
                    debug!(task_id = %task.id, "claim_ready: lost claim");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(claimed = claimed.len(), "claim_ready: done");
        Ok(claimed)
    }

    async fn dep_statuses(&self, tasks: &[Task]) -> PipelineResult<HashMap<String, TaskStatus>> {
        let mut ids: Vec<&str> = tasks.iter().flat_map(|t| t.deps.iter().map(String::as_str)).collect();
        ids.sort_unstable();
        ids.dedup();
        let mut statuses = HashMap::new();
        for chunk in ids.chunks(entitystore::MAX_IN_VALUES) {
            let query = Query::new(Task::COLLECTION).filter(Filter::id_in(chunk));
            for doc in self.state.query(query).await? {
                let task = Task::from_document(&doc)?;
                statuses.insert(task.id, task.status);
            }
        }
        Ok(statuses)
    }

    /// Requeue running tasks whose lease ran out. Returns how many were recovered.
    pub async fn recover_expired(&self, now: i64) -> PipelineResult<usize> {
        debug!(now, "recover_expired: called");
        let query = Query::new(Task::COLLECTION).filter(Filter::eq("status", TaskStatus::Running.as_str()));
        let mut recovered = 0;
        for doc in self.state.query(query).await? {
            let task = Task::from_document(&doc)?;
            if !task.lease_expired(now) {
                continue;
            }
            warn!(task_id = %task.id, key = %task.key, "Lease expired, redelivering");
            let result = self
                .modify(&task.id, |task| {
                    if !task.lease_expired(now) {
                        return Ok(false);
                    }
                    task.lease_until = None;
                    if task.attempts_left() {
                        task.status = task.status.transition(TaskStatus::Queued)?;
                        task.delivery_count += 1;
                        task.run_at = now;
                    } else {
                        task.status = task.status.transition(TaskStatus::Failed)?;
                        task.last_error = Some("lease expired".to_string());
                    }
                    Ok(true)
                })
                .await;
            match result {
                Ok(Some(_)) => recovered += 1,
                Ok(None) => {}
                Err(PipelineError::Conflict(_)) => debug!(task_id = %task.id, "recover_expired: raced"),
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    pub async fn complete(&self, task: &Task) -> PipelineResult<()> {
        debug!(task_id = %task.id, key = %task.key, "complete: called");
        self.modify_always(&task.id, |task| {
            task.status = task.status.transition(TaskStatus::Succeeded)?;
            task.lease_until = None;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Record a failed run. Transient errors requeue while attempts remain;
    /// anything else parks the task as failed.
    pub async fn fail(&self, task: &Task, error: &PipelineError) -> PipelineResult<TaskStatus> {
        debug!(task_id = %task.id, key = %task.key, %error, "fail: called");
        let now = entitystore::now_ms();
        let retry_delay = self.retry_delay;
        let updated = self
            .modify_always(&task.id, |task| {
                task.lease_until = None;
                task.last_error = Some(error.to_string());
                if !error.is_fatal() && task.attempts_left() {
                    let backoff = retry_delay.saturating_mul(2u32.saturating_pow(task.attempts.saturating_sub(1)).min(16));
                    task.status = task.status.transition(TaskStatus::Queued)?;
                    task.run_at = now + backoff.as_millis() as i64;
                } else {
                    task.status = task.status.transition(TaskStatus::Failed)?;
                }
                Ok(())
            })
            .await?;

        if updated.status == TaskStatus::Failed {
            warn!(task_id = %updated.id, key = %updated.key, %error, "Task failed");
            self.events.emit(PipelineEvent::TaskFailed {
                task_id: updated.id.clone(),
                key: updated.key.clone(),
                error: error.to_string(),
            });
        } else {
            info!(task_id = %updated.id, key = %updated.key, attempt = updated.attempts, "Task requeued");
        }
        Ok(updated.status)
    }

    /// Put failed tasks back in the queue with fresh attempts
    pub async fn resume_failed(&self, stage: Option<StageName>) -> PipelineResult<usize> {
        debug!(?stage, "resume_failed: called");
        let now = entitystore::now_ms();
        let mut resumed = 0;
        for task in self.list(Some(TaskStatus::Failed)).await? {
            if stage.is_some_and(|s| s != task.stage) {
                continue;
            }
            self.modify_always(&task.id, |task| {
                task.status = task.status.transition(TaskStatus::Queued)?;
                task.attempts = 0;
                task.run_at = now;
                Ok(())
            })
            .await?;
            resumed += 1;
        }
        info!(resumed, "Resumed failed tasks");
        Ok(resumed)
    }

    /// Tasks, oldest first
    pub async fn list(&self, status: Option<TaskStatus>) -> PipelineResult<Vec<Task>> {
        debug!(?status, "list: called");
        let mut query = Query::new(Task::COLLECTION).order_by("created_at", Order::Asc);
        if let Some(status) = status {
            query = query.filter(Filter::eq("status", status.as_str()));
        }
        self.state
            .query(query)
            .await?
            .iter()
            .map(|doc| Task::from_document(doc).map_err(PipelineError::from))
            .collect()
    }

    /// Queued plus running
    pub async fn pending_count(&self) -> PipelineResult<usize> {
        debug!("pending_count: called");
        let query = Query::new(Task::COLLECTION).filter(Filter::is_in(
            "status",
            vec![json!(TaskStatus::Queued.as_str()), json!(TaskStatus::Running.as_str())],
        ));
        Ok(self.state.query(query).await?.len())
    }

    /// Earliest `run_at` among queued tasks
    pub async fn next_run_at(&self) -> PipelineResult<Option<i64>> {
        debug!("next_run_at: called");
        let query = Query::new(Task::COLLECTION)
            .filter(Filter::eq("status", TaskStatus::Queued.as_str()))
            .order_by("run_at", Order::Asc)
            .limit(1);
        Ok(self
            .state
            .query(query)
            .await?
            .first()
            .and_then(|doc| doc.get("run_at"))
            .and_then(Value::as_i64))
    }

    /// Read-modify-write one task under a version pin. `change` returns
    /// false to leave the task untouched, which yields `None`.
    async fn modify(
        &self,
        task_id: &str,
        change: impl FnOnce(&mut Task) -> Result<bool, TransitionError>,
    ) -> PipelineResult<Option<Task>> {
        let reference = DocRef::new(Task::COLLECTION, task_id);
        let mut tx = Transaction::begin(&self.state);
        let mut task = Task::from_document(&tx.get_required(&reference).await?)?;
        if !change(&mut task)? {
            return Ok(None);
        }
        task.updated_at = entitystore::now_ms();
        tx.update(reference, task.to_fields()?);
        tx.commit().await?;
        Ok(Some(task))
    }

    async fn modify_always(
        &self,
        task_id: &str,
        change: impl FnOnce(&mut Task) -> Result<(), TransitionError>,
    ) -> PipelineResult<Task> {
        self.modify(task_id, |task| change(task).map(|_| true))
            .await?
            .ok_or_else(|| PipelineError::Internal(format!("task {} left unchanged", task_id)))
    }
}

fn fields(value: Value) -> entitystore::Fields {
    match value {
        Value::Object(map) => map,
        _ => entitystore::Fields::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (StateManager, TaskQueue) {
        let state = StateManager::spawn_in_memory().unwrap();
        let queue = TaskQueue::new(state.clone(), EventBus::default(), &DispatchConfig::default())
            .with_retry_delay(Duration::ZERO);
        (state, queue)
    }

    #[tokio::test]
    async fn test_enqueue_and_claim() {
        let (_state, queue) = queue();
        let enqueued = queue
            .enqueue(TaskSpec::new(StageName::SupplierFinder, "m1").with_params(json!({"hint": "steel"})))
            .await
            .unwrap();
        assert!(enqueued.is_created());

        let claimed = queue.claim_ready(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, TaskStatus::Running);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].params["hint"], "steel");
        assert!(claimed[0].lease_until.is_some());

        // nothing left to claim while it runs
        assert!(queue.claim_ready(10).await.unwrap().is_empty());
        assert_eq!(queue.pending_count().await.unwrap(), 1);

        queue.complete(&claimed[0]).await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        let task = queue.get(enqueued.id()).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_dependencies_gate_claims() {
        let (_state, queue) = queue();
        let results = queue
            .enqueue_all(vec![
                TaskSpec::new(StageName::MaterialFootprint, "m1"),
                TaskSpec::new(StageName::TransportFootprint, "m1"),
                TaskSpec::new(StageName::FootprintReview, "m1").after(0).after(1),
            ])
            .await
            .unwrap();
        assert_eq!(results.len(), 3);

        let first = queue.claim_ready(10).await.unwrap();
        let stages: Vec<_> = first.iter().map(|t| t.stage).collect();
        assert_eq!(first.len(), 2);
        assert!(!stages.contains(&StageName::FootprintReview));

        queue.complete(&first[0]).await.unwrap();
        assert!(queue.claim_ready(10).await.unwrap().is_empty());

        queue.complete(&first[1]).await.unwrap();
        let review = queue.claim_ready(10).await.unwrap();
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].stage, StageName::FootprintReview);
    }

    #[tokio::test]
    async fn test_forward_local_dep_rejected() {
        let (_state, queue) = queue();
        let err = queue
            .enqueue_all(vec![TaskSpec::new(StageName::FootprintReview, "m1").after(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(queue.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dedupe_queued_pulls_forward() {
        let (_state, queue) = queue();
        let delayed = queue
            .enqueue_delayed(StageName::CompletionCheck, "p1", Duration::from_secs(300))
            .await
            .unwrap();
        assert!(queue.claim_ready(10).await.unwrap().is_empty());

        let again = queue
            .enqueue(TaskSpec::new(StageName::CompletionCheck, "p1").dedupe(Dedupe::Queued))
            .await
            .unwrap();
        assert_eq!(again, Enqueued::Existing(delayed.id().to_string()));

        let claimed = queue.claim_ready(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, delayed.id());
    }

    #[tokio::test]
    async fn test_dedupe_queued_ignores_running_task() {
        let (_state, queue) = queue();
        let spec = || TaskSpec::new(StageName::CompletionCheck, "p1").dedupe(Dedupe::Queued);
        let first = queue.enqueue(spec()).await.unwrap();
        let running = queue.claim_ready(1).await.unwrap().remove(0);
        assert_eq!(running.id, first.id());

        let second = queue.enqueue(spec()).await.unwrap();
        assert!(second.is_created());
        let third = queue.enqueue(spec()).await.unwrap();
        assert_eq!(third.id(), second.id());
    }

    #[tokio::test]
    async fn test_dedupe_any_reuses_finished_task() {
        let (_state, queue) = queue();
        let spec = || TaskSpec::new(StageName::Uncertainty, "m1").dedupe(Dedupe::Any);
        let first = queue.enqueue(spec()).await.unwrap();
        let task = queue.claim_ready(1).await.unwrap().remove(0);
        queue.complete(&task).await.unwrap();

        let second = queue.enqueue(spec()).await.unwrap();
        assert!(!second.is_created());
        assert_eq!(second.id(), first.id());

        // Queued ignores finished tasks
        let third = queue
            .enqueue(TaskSpec::new(StageName::Uncertainty, "m1").dedupe(Dedupe::Queued))
            .await
            .unwrap();
        assert!(third.is_created());
    }

    #[tokio::test]
    async fn test_dedupe_within_one_batch() {
        let (_state, queue) = queue();
        let results = queue
            .enqueue_all(vec![
                TaskSpec::new(StageName::CompletionCheck, "p1").dedupe(Dedupe::Queued),
                TaskSpec::new(StageName::CompletionCheck, "p1").dedupe(Dedupe::Queued),
            ])
            .await
            .unwrap();
        assert_eq!(results[0].id(), results[1].id());
        assert_eq!(queue.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_until_exhausted() {
        let (_state, queue) = queue();
        queue.enqueue(TaskSpec::new(StageName::SupplierFinder, "m1")).await.unwrap();
        let error = PipelineError::Unavailable("upstream down".to_string());

        for attempt in 1..=3 {
            let task = queue.claim_ready(1).await.unwrap().remove(0);
            assert_eq!(task.attempts, attempt);
            let status = queue.fail(&task, &error).await.unwrap();
            let expected = if attempt < 3 { TaskStatus::Queued } else { TaskStatus::Failed };
            assert_eq!(status, expected);
        }
        let failed = queue.list(Some(TaskStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error.as_deref().unwrap().contains("upstream down"));
    }

    #[tokio::test]
    async fn test_fatal_failure_parks_and_resumes() {
        let state = StateManager::spawn_in_memory().unwrap();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let queue = TaskQueue::new(state, events, &DispatchConfig::default());
        queue.enqueue(TaskSpec::new(StageName::SupplierFinder, "m1")).await.unwrap();

        let task = queue.claim_ready(1).await.unwrap().remove(0);
        let status = queue
            .fail(&task, &PipelineError::Validation("bad entity".to_string()))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Failed);
        assert!(matches!(rx.recv().await.unwrap(), PipelineEvent::TaskFailed { .. }));

        assert_eq!(queue.resume_failed(Some(StageName::Uncertainty)).await.unwrap(), 0);
        assert_eq!(queue.resume_failed(None).await.unwrap(), 1);
        let task = queue.claim_ready(1).await.unwrap().remove(0);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_redelivers() {
        let (_state, queue) = queue();
        let queue = queue.with_lease(Duration::ZERO);
        queue.enqueue(TaskSpec::new(StageName::MaterialFootprint, "m1")).await.unwrap();

        let first = queue.claim_ready(1).await.unwrap().remove(0);
        assert_eq!(first.delivery_count, 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let again = queue.claim_ready(1).await.unwrap().remove(0);
        assert_eq!(again.id, first.id);
        assert_eq!(again.delivery_count, 1);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_priority_and_next_run_at() {
        let (_state, queue) = queue();
        assert_eq!(queue.next_run_at().await.unwrap(), None);
        queue.enqueue(TaskSpec::new(StageName::Uncertainty, "a")).await.unwrap();
        queue
            .enqueue(TaskSpec::new(StageName::CompletionCheck, "b").priority(5))
            .await
            .unwrap();
        assert!(queue.next_run_at().await.unwrap().is_some());

        let claimed = queue.claim_ready(1).await.unwrap();
        assert_eq!(claimed[0].stage, StageName::CompletionCheck);
    }
}
