//! Execution engine (C7, spec.md §4.7).
//!
//! Drives the dispatch state machine: dequeue -> transition to executing
//! -> substitute params -> call the registry under a deadline -> record
//! the outcome -> gate dependents through the resolver -> notify the
//! workflow manager. Bounded concurrency, backpressure, worker heartbeat
//! and stale-claim reclaim are all grounded on the teacher's
//! `worker/pool.rs` `WorkerPool` (semaphore-bounded dispatch, a
//! `tokio::sync::watch` shutdown signal, three independent background
//! loops) adapted from activity-handler dispatch to this engine's fixed
//! "dispatch one task through the registry" handler.
//!
//! Cyclic references between the engine and the workflow manager (C8) are
//! broken the way the teacher avoids an equivalent cycle between its
//! executor and registry: the engine is the only side that holds a
//! strong reference to its collaborators (`Store`, `ProtocolRegistry`,
//! the resolver, the queue, the retry manager); the workflow manager is
//! notified back through a narrow `WorkflowObserver` interface held as a
//! `Weak`, so neither side keeps the other alive.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{error, instrument, warn};

use flowmesh_core::{Task, TaskError, TaskId, TaskResult, TaskStatus};
use flowmesh_persistence::{DeadLetterEntry, Store, StoreError};
use flowmesh_registry::ProtocolRegistry;

use crate::backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
use crate::queue::{PriorityQueue, QueueError, DEFAULT_QUEUE};
use crate::resolver::{DependencyResolver, ResolverError};
use crate::retry::{RetryError, RetryManager};
use crate::substitution;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error(transparent)]
    Retry(#[from] RetryError),
    #[error(transparent)]
    Backpressure(#[from] BackpressureError),
}

/// The three run modes named in spec.md §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Dispatch whatever is currently queued, once, and return.
    SingleShot,
    /// Keep dispatching (including retries as they come due) until every
    /// workflow known to `Store` is terminal and the queue is empty.
    WorkflowOnly,
    /// Run indefinitely: dispatch loop, retry ticker, worker heartbeat and
    /// stale-claim reclaim all run as background loops until `shutdown()`
    /// is called.
    EventDriven,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_id: String,
    pub worker_group: String,
    pub queue_name: String,
    pub max_concurrent_tasks: usize,
    pub dispatch_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stale_reclaim_interval: Duration,
    pub stale_threshold: Duration,
    pub shutdown_timeout: Duration,
    pub backpressure: BackpressureConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("engine-{}", uuid::Uuid::now_v7()),
            worker_group: "default".to_string(),
            queue_name: DEFAULT_QUEUE.to_string(),
            max_concurrent_tasks: 10,
            dispatch_poll_interval: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(5),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n;
        self
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_backpressure(mut self, backpressure: BackpressureConfig) -> Result<Self, BackpressureError> {
        backpressure.validate()?;
        self.backpressure = backpressure;
        Ok(self)
    }
}

/// Narrow interface the Workflow Manager (C8) implements to hear about
/// terminal task outcomes without the engine holding a strong reference
/// back to it.
pub trait WorkflowObserver: Send + Sync {
    /// A task just transitioned into `executing` for the first time in
    /// this workflow. The Workflow Manager (C8) uses this to flip
    /// `pending -> running` the instant the first task starts (spec.md
    /// §4.8: "enters running the instant the first task enters
    /// executing").
    fn on_task_started(&self, workflow_id: &str, task_id: &str);

    /// A task reached a terminal status (`completed`, `failed` or
    /// `cancelled`).
    fn on_task_terminal(&self, workflow_id: &str, task_id: &str, status: TaskStatus);
}

pub struct ExecutionEngine {
    store: Arc<dyn Store>,
    registry: Arc<ProtocolRegistry>,
    resolver: DependencyResolver,
    queue: PriorityQueue,
    retry_manager: RetryManager,
    config: EngineConfig,
    backpressure: BackpressureState,
    active_tasks: Arc<Semaphore>,
    executing: DashSet<TaskId>,
    observer: RwLock<Option<Weak<dyn WorkflowObserver>>>,
    shutdown_tx: RwLock<Option<watch::Sender<bool>>>,
}

impl ExecutionEngine {
    pub fn new(store: Arc<dyn Store>, registry: Arc<ProtocolRegistry>, config: EngineConfig) -> Arc<Self> {
        let queue = PriorityQueue::named(store.clone(), config.queue_name.clone());
        let retry_manager = RetryManager::new(store.clone());
        let backpressure = BackpressureState::new(config.backpressure, config.max_concurrent_tasks);
        Arc::new(Self {
            active_tasks: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            store,
            registry,
            resolver: DependencyResolver::new(),
            queue,
            retry_manager,
            config,
            backpressure,
            executing: DashSet::new(),
            observer: RwLock::new(None),
            shutdown_tx: RwLock::new(None),
        })
    }

    pub fn set_observer(&self, observer: Weak<dyn WorkflowObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a workflow's tasks: persist every task, run them through
    /// the resolver, and enqueue whichever have no dependencies at all.
    pub async fn submit_tasks(&self, workflow_id: &str, tasks: &[Task]) -> Result<Vec<TaskId>, ExecutorError> {
        for task in tasks {
            let mut persisted = task.clone();
            persisted.workflow_id = Some(workflow_id.to_string());
            self.store.save_task(&persisted).await?;
        }
        let ready = self.resolver.register(workflow_id, tasks)?;
        for id in &ready {
            self.enqueue_ready(id).await?;
        }
        Ok(ready)
    }

    /// Preemptively cancel every non-terminal task in a workflow. Used by
    /// the workflow manager for the `stop` error strategy: the moment any
    /// task fails, everything else still pending/queued/retry-scheduled
    /// is cancelled outright rather than left to drain naturally (spec.md
    /// §4.8 `stop`).
    pub async fn cancel_non_terminal_tasks(&self, workflow_id: &str) -> Result<(), ExecutorError> {
        for task in self.store.get_tasks_by_workflow(workflow_id).await? {
            if !task.status.is_terminal() {
                self.store.update_task_status(&task.id, TaskStatus::Cancelled).await?;
            }
        }
        Ok(())
    }

    /// Rebuild the resolver's in-memory dependency index for one
    /// non-terminal workflow from its persisted tasks, and enqueue
    /// whichever are still `pending` and now dependency-free (spec.md §8
    /// "crash recovery": every non-terminal task is re-enqueued exactly
    /// once after a restart). Tasks already `queued`/`ready`/
    /// `retry_scheduled` are untouched — they are already findable via
    /// the persisted queue/retry-schedule tables; `executing` tasks are
    /// left for the stale-claim reclaim loop once their worker's
    /// heartbeat goes quiet.
    pub async fn recover_workflow(&self, workflow_id: &str) -> Result<Vec<TaskId>, ExecutorError> {
        let tasks = self.store.get_tasks_by_workflow(workflow_id).await?;
        let completed: std::collections::HashSet<TaskId> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect();
        let ready = self.resolver.register_resumed(workflow_id, &tasks, &completed);
        for id in &ready {
            self.enqueue_ready(id).await?;
        }
        Ok(ready)
    }

    async fn enqueue_ready(&self, task_id: &str) -> Result<(), ExecutorError> {
        let Some(task) = self.store.get_task(task_id).await? else { return Ok(()) };
        self.store.update_task_status(task_id, TaskStatus::Queued).await?;
        self.queue.enqueue(task_id, task.priority).await?;
        Ok(())
    }

    /// The dispatch state machine for one task (spec.md §4.7 steps 2-7;
    /// step 1, dequeueing, happens in the caller).
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn dispatch_one(&self, task_id: TaskId) -> Result<(), ExecutorError> {
        let Some(mut task) = self.store.get_task(&task_id).await? else { return Ok(()) };
        if !matches!(task.status, TaskStatus::Queued | TaskStatus::Ready) {
            return Ok(());
        }

        task.attempt += 1;
        task.status = TaskStatus::Executing;
        task.started_at = Some(Utc::now());
        task.worker_id = Some(self.config.worker_id.clone());
        self.store.update_task_status(&task_id, TaskStatus::Executing).await?;
        self.store.save_task(&task).await?;
        self.executing.insert(task_id.clone());
        if let Some(workflow_id) = &task.workflow_id {
            self.notify_started(workflow_id, &task_id);
        }

        let results = self.collect_results(task.workflow_id.as_deref()).await?;
        let resolved_params = substitution::substitute_params(&task.params, &results);

        let outcome = tokio::time::timeout(
            task.effective_timeout(),
            self.registry.execute(&task.protocol, &task.method, resolved_params),
        )
        .await;

        self.executing.remove(&task_id);

        // Cooperative cancellation: a failure elsewhere in the workflow
        // may have marked this task Cancelled while the call above was
        // in flight. The outcome is discarded, not overwritten.
        if let Some(current) = self.store.get_task(&task_id).await? {
            if current.status == TaskStatus::Cancelled {
                return Ok(());
            }
        }

        match outcome {
            Ok(Ok(value)) => self.record_success(&task, value).await,
            Ok(Err(task_error)) => self.record_failure(&task, task_error).await,
            Err(_elapsed) => {
                let timeout_err = TaskError::timeout(
                    "TASK_TIMEOUT",
                    format!("call exceeded {:?}", task.effective_timeout()),
                );
                self.record_failure(&task, timeout_err).await
            }
        }
    }

    async fn collect_results(&self, workflow_id: Option<&str>) -> Result<BTreeMap<TaskId, TaskResult>, ExecutorError> {
        let Some(workflow_id) = workflow_id else { return Ok(BTreeMap::new()) };
        let mut map = BTreeMap::new();
        for sibling in self.store.get_tasks_by_workflow(workflow_id).await? {
            if let Some(result) = self.store.get_task_result(&sibling.id).await? {
                map.insert(sibling.id, result);
            }
        }
        Ok(map)
    }

    async fn record_success(&self, task: &Task, value: serde_json::Value) -> Result<(), ExecutorError> {
        // The terminal status commits before the result: spec.md §4.1
        // requires "a committed result implies a committed terminal
        // status", so the status write must never trail the result write.
        let mut completed = task.clone();
        completed.status = TaskStatus::Completed;
        completed.completed_at = Some(Utc::now());
        self.store.save_task(&completed).await?;

        let result = TaskResult::completed(
            &task.id,
            task.workflow_id.clone(),
            value,
            task.started_at.unwrap_or_else(Utc::now),
            task.attempt,
        );
        self.store.save_task_result(&result).await?;

        if let Some(workflow_id) = &task.workflow_id {
            let ready = self.resolver.on_task_completed(workflow_id, &task.id);
            for id in ready {
                self.enqueue_ready(&id).await?;
            }
            self.notify_observer(workflow_id, &task.id, TaskStatus::Completed);
        }
        Ok(())
    }

    async fn record_failure(&self, task: &Task, error: TaskError) -> Result<(), ExecutorError> {
        let mut updated = task.clone();
        updated.last_error = Some(error.clone());

        if self.retry_manager.schedule_retry(&updated, &error).await? {
            updated.status = TaskStatus::RetryScheduled;
            self.store.save_task(&updated).await?;
            return Ok(());
        }

        // As in `record_success`, the terminal status commits before the
        // result so a committed result always implies a committed
        // terminal status (spec.md §4.1).
        updated.status = TaskStatus::Failed;
        updated.completed_at = Some(Utc::now());
        self.store.save_task(&updated).await?;

        let result = TaskResult::failed(
            &task.id,
            task.workflow_id.clone(),
            &error,
            task.started_at.unwrap_or_else(Utc::now),
            task.attempt,
        );
        self.store.save_task_result(&result).await?;
        self.store
            .save_dead_letter(&DeadLetterEntry {
                task_id: task.id.clone(),
                workflow_id: task.workflow_id.clone(),
                final_error: error.to_string(),
                attempt: task.attempt,
                dead_lettered_at: Utc::now(),
            })
            .await?;

        if let Some(workflow_id) = &task.workflow_id {
            for cancelled_id in self.resolver.on_task_failed(workflow_id, &task.id) {
                self.store.update_task_status(&cancelled_id, TaskStatus::Cancelled).await?;
            }
            self.notify_observer(workflow_id, &task.id, TaskStatus::Failed);
        }
        Ok(())
    }

    fn notify_observer(&self, workflow_id: &str, task_id: &str, status: TaskStatus) {
        if let Some(observer) = self.observer.read().as_ref().and_then(Weak::upgrade) {
            observer.on_task_terminal(workflow_id, task_id, status);
        }
    }

    fn notify_started(&self, workflow_id: &str, task_id: &str) {
        if let Some(observer) = self.observer.read().as_ref().and_then(Weak::upgrade) {
            observer.on_task_started(workflow_id, task_id);
        }
    }

    async fn tick_retries(&self) -> Result<(), ExecutorError> {
        for task_id in self.store.pop_due_retries(Utc::now()).await? {
            self.enqueue_ready(&task_id).await?;
        }
        Ok(())
    }

    async fn reclaim_stale_claims(&self) -> Result<(), ExecutorError> {
        let threshold = Utc::now()
            - chrono::Duration::from_std(self.config.stale_threshold).unwrap_or_else(|_| chrono::Duration::zero());
        for worker in self.store.list_stale_workers(threshold).await? {
            for task_id in &worker.claimed_task_ids {
                if let Some(task) = self.store.get_task(task_id).await? {
                    if task.status == TaskStatus::Executing {
                        warn!(worker_id = %worker.worker_id, task_id = %task_id, "reclaiming stale claim");
                        self.store.update_task_status(task_id, TaskStatus::Queued).await?;
                        self.queue.enqueue(task_id, task.priority).await?;
                    }
                }
            }
            self.store.deregister_worker(&worker.worker_id).await?;
        }
        Ok(())
    }

    /// Dispatch everything currently sitting in the queue, bounded by
    /// `max_concurrent_tasks` and backpressure; returns once every
    /// spawned dispatch has completed.
    async fn dispatch_available(self: &Arc<Self>) -> Result<usize, ExecutorError> {
        let mut handles = Vec::new();
        loop {
            if !self.backpressure.is_accepting() {
                break;
            }
            let Ok(permit) = self.active_tasks.clone().try_acquire_owned() else { break };
            let Some(task_id) = self.queue.dequeue().await? else { break };
            self.backpressure.task_started();
            let engine = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                if let Err(err) = engine.dispatch_one(task_id.clone()).await {
                    error!(task_id = %task_id, error = %err, "dispatch failed");
                }
                engine.backpressure.task_completed();
                drop(permit);
            }));
        }
        let dispatched = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(dispatched)
    }

    /// Run the engine in one of the three modes named in spec.md §4.7.
    pub async fn run(self: &Arc<Self>, mode: RunMode) -> Result<(), ExecutorError> {
        match mode {
            RunMode::SingleShot => {
                self.tick_retries().await?;
                self.dispatch_available().await?;
                Ok(())
            }
            RunMode::WorkflowOnly => {
                loop {
                    self.tick_retries().await?;
                    self.dispatch_available().await?;
                    let queue_idle = self.queue.stats().await?.size == 0;
                    let no_active_workflows = self.store.list_active_workflows().await?.is_empty();
                    if queue_idle && no_active_workflows {
                        return Ok(());
                    }
                    tokio::time::sleep(self.config.dispatch_poll_interval).await;
                }
            }
            RunMode::EventDriven => self.run_event_driven().await,
        }
    }

    /// Signal a running `EventDriven` loop to stop and drain.
    pub fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.read().as_ref() {
            let _ = tx.send(true);
        }
    }

    async fn run_event_driven(self: &Arc<Self>) -> Result<(), ExecutorError> {
        self.store.register_worker(&self.config.worker_id, &self.config.worker_group).await?;
        let (tx, mut shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.write() = Some(tx);

        let dispatch_loop = {
            let engine = Arc::clone(self);
            let mut rx = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = rx.changed() => break,
                        _ = tokio::time::sleep(engine.config.dispatch_poll_interval) => {
                            if let Err(err) = engine.tick_retries().await {
                                error!(error = %err, "retry tick failed");
                            }
                            if let Err(err) = engine.dispatch_available().await {
                                error!(error = %err, "dispatch pass failed");
                            }
                        }
                    }
                }
            })
        };

        let heartbeat_loop = {
            let engine = Arc::clone(self);
            let mut rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(engine.config.heartbeat_interval);
                loop {
                    tokio::select! {
                        _ = rx.changed() => break,
                        _ = ticker.tick() => {
                            let claimed: Vec<TaskId> = engine.executing.iter().map(|e| e.clone()).collect();
                            if let Err(err) = engine.store.heartbeat_worker(&engine.config.worker_id, claimed).await {
                                error!(error = %err, "heartbeat failed");
                            }
                        }
                    }
                }
            })
        };

        let reclaim_loop = {
            let engine = Arc::clone(self);
            let mut rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(engine.config.stale_reclaim_interval);
                loop {
                    tokio::select! {
                        _ = rx.changed() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = engine.reclaim_stale_claims().await {
                                error!(error = %err, "stale-claim reclaim failed");
                            }
                        }
                    }
                }
            })
        };

        shutdown_rx.changed().await.ok();
        let _ = tokio::join!(dispatch_loop, heartbeat_loop, reclaim_loop);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while self.active_tasks.available_permits() < self.config.max_concurrent_tasks
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.store.deregister_worker(&self.config.worker_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowmesh_core::{MethodSpec, ParameterSpec, ParameterType, Priority, Provider, ProtocolSpec, RetryConfig};
    use flowmesh_persistence::InMemoryStore;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn provider_id(&self) -> &str {
            "echo-1"
        }
        fn protocol_id(&self) -> &str {
            "math/v1"
        }
        async fn initialize(&self) -> Result<(), TaskError> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<(), TaskError> {
            Ok(())
        }
        async fn health_check(&self) -> flowmesh_core::HealthCheckResult {
            flowmesh_core::HealthCheckResult::healthy("ok")
        }
        async fn handle_request(&self, _method: &str, params: serde_json::Value) -> Result<serde_json::Value, TaskError> {
            Ok(params)
        }
        fn get_supported_methods(&self) -> Vec<String> {
            vec!["add".to_string()]
        }
    }

    fn math_protocol() -> ProtocolSpec {
        ProtocolSpec::new("math/v1").with_method(
            MethodSpec::new("add")
                .with_param(ParameterSpec::new("a", ParameterType::Number).required())
                .with_param(ParameterSpec::new("b", ParameterType::Number).required()),
        )
    }

    async fn engine_with_echo_provider() -> Arc<ExecutionEngine> {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let registry = Arc::new(ProtocolRegistry::new());
        registry.register_protocol(math_protocol()).unwrap();
        registry.register_provider(Arc::new(EchoProvider)).await.unwrap();
        ExecutionEngine::new(store, registry, EngineConfig::default())
    }

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(id, "math/v1", "add");
        t.params = json!({"a": 1, "b": 2});
        t.dependencies = deps.iter().map(|d| d.to_string()).collect();
        t.retry_config = RetryConfig::no_retry();
        t.priority = Priority::Normal;
        t
    }

    #[tokio::test]
    async fn single_shot_dispatches_a_ready_task_to_completion() {
        let engine = engine_with_echo_provider().await;
        engine.submit_tasks("wf1", &[task("t1", &[])]).await.unwrap();
        engine.run(RunMode::SingleShot).await.unwrap();

        let result = engine.store.get_task_result("t1").await.unwrap().unwrap();
        assert!(result.is_completed());
    }

    #[tokio::test]
    async fn dependent_task_runs_only_after_its_dependency_completes() {
        let engine = engine_with_echo_provider().await;
        engine.submit_tasks("wf1", &[task("t1", &[]), task("t2", &["t1"])]).await.unwrap();

        // Only t1 is ready initially.
        assert_eq!(engine.queue.stats().await.unwrap().size, 1);

        engine.run(RunMode::WorkflowOnly).await.unwrap();

        assert!(engine.store.get_task_result("t1").await.unwrap().unwrap().is_completed());
        assert!(engine.store.get_task_result("t2").await.unwrap().unwrap().is_completed());
    }

    #[tokio::test]
    async fn cancelled_task_outcome_is_discarded_not_overwritten() {
        let engine = engine_with_echo_provider().await;
        engine.submit_tasks("wf1", &[task("t1", &[])]).await.unwrap();
        engine.store.update_task_status("t1", TaskStatus::Cancelled).await.unwrap();

        // Re-queue manually to exercise dispatch_one directly even though
        // the status guard would normally have prevented this.
        let mut t1 = engine.store.get_task("t1").await.unwrap().unwrap();
        t1.status = TaskStatus::Queued;
        engine.store.save_task(&t1).await.unwrap();
        engine.store.update_task_status("t1", TaskStatus::Cancelled).await.unwrap();

        engine.dispatch_one("t1".to_string()).await.unwrap();
        assert!(engine.store.get_task_result("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backpressure_limits_concurrent_dispatch() {
        let engine = engine_with_echo_provider().await;
        let many: Vec<Task> = (0..5).map(|i| task(&format!("t{i}"), &[])).collect();
        engine.submit_tasks("wf1", &many).await.unwrap();
        assert!(engine.config.max_concurrent_tasks >= 5);
        tokio::time::timeout(StdDuration::from_secs(5), engine.run(RunMode::SingleShot))
            .await
            .unwrap()
            .unwrap();
        for i in 0..5 {
            assert!(engine.store.get_task_result(&format!("t{i}")).await.unwrap().unwrap().is_completed());
        }
    }
}
