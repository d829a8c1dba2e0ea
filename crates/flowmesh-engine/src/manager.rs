//! Workflow manager (C8, spec.md §4.8).
//!
//! The top-level entry point: validates and persists a declarative task
//! DAG, hands its tasks to the Execution Engine (C7), and reconciles the
//! workflow's own lifecycle (`pending -> running -> {completed|failed|
//! cancelled}`) as task outcomes arrive via the `WorkflowObserver`
//! interface. Grounded in the teacher's `start_workflow`/`process_workflow`
//! pair (`crates/durable/src/engine/executor.rs`), generalized from
//! "start one user-defined workflow type" to "validate and persist a
//! declarative task DAG" (SPEC_FULL.md §4.8).
//!
//! Holds the only strong reference in either direction between the
//! manager and the engine; the engine only ever sees this type through
//! the narrow `Weak<dyn WorkflowObserver>` it was handed in `new`.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use thiserror::Error;
use tracing::error;

use flowmesh_core::{ErrorStrategy, ExecutionStatus, Task, TaskStatus, Workflow, WorkflowId, WorkflowStatus};
use flowmesh_persistence::{Store, StoreError};

use crate::executor::{ExecutionEngine, ExecutorError, WorkflowObserver};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),
}

/// Owns the workflow lifecycle on top of one `ExecutionEngine`.
pub struct WorkflowManager {
    store: Arc<dyn Store>,
    engine: Arc<ExecutionEngine>,
}

impl WorkflowManager {
    /// Build a manager over `engine` and register it as the engine's
    /// observer. Returns an `Arc` since the engine only holds a `Weak`
    /// back-reference — the caller must keep this `Arc` alive for the
    /// observer callbacks to fire.
    pub fn new(store: Arc<dyn Store>, engine: Arc<ExecutionEngine>) -> Arc<Self> {
        let manager = Arc::new(Self { store, engine: engine.clone() });
        let observer: Weak<dyn WorkflowObserver> = Arc::downgrade(&manager);
        engine.set_observer(observer);
        manager
    }

    /// Validate and persist a workflow, then hand its tasks to the
    /// engine. A `Workflow.id` that already exists in `Store` is an
    /// idempotent resume: the existing workflow's id is returned without
    /// re-inserting its tasks (resolved Open Question, SPEC_FULL.md §9 —
    /// consistent with the at-least-once delivery model spec.md §2
    /// already commits to for task dispatch).
    ///
    /// A workflow with no tasks at all completes immediately: "every
    /// task has a completed `TaskResult`" holds vacuously.
    pub async fn submit_workflow(&self, mut workflow: Workflow) -> Result<WorkflowId, ManagerError> {
        if let Some(existing) = self.store.get_workflow(&workflow.id).await? {
            return Ok(existing.id);
        }

        workflow.status = WorkflowStatus::Pending;
        self.store.save_workflow(&workflow).await?;

        if workflow.tasks.is_empty() {
            self.store.update_workflow_status(&workflow.id, WorkflowStatus::Completed).await?;
            return Ok(workflow.id);
        }

        if let Err(err) = self.engine.submit_tasks(&workflow.id, &workflow.tasks).await {
            self.store.update_workflow_status(&workflow.id, WorkflowStatus::Failed).await?;
            return Err(err.into());
        }

        Ok(workflow.id)
    }

    /// Snapshot of a workflow's progress (spec.md §4.8
    /// `get_execution_status`).
    pub async fn get_execution_status(&self, workflow_id: &str) -> Result<ExecutionStatus, ManagerError> {
        let workflow = self.fetch_workflow(workflow_id).await?;
        let mut results = BTreeMap::new();
        for task in &workflow.tasks {
            if let Some(result) = self.store.get_task_result(&task.id).await? {
                results.insert(task.id.clone(), result);
            }
        }
        let statuses = self
            .store
            .get_tasks_by_workflow(workflow_id)
            .await?
            .into_iter()
            .map(|t| (t.id, t.status))
            .collect();
        Ok(workflow.execution_status(&results, &statuses))
    }

    /// Cancel a workflow: every non-terminal task is cancelled outright
    /// (cooperative for `executing` tasks — their in-flight outcome is
    /// discarded, preemptive for queued/scheduled ones, spec.md §5).
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<(), ManagerError> {
        let workflow = self.fetch_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Ok(());
        }
        self.engine.cancel_non_terminal_tasks(workflow_id).await?;
        self.store.update_workflow_status(workflow_id, WorkflowStatus::Cancelled).await?;
        Ok(())
    }

    pub async fn list_active_executions(&self) -> Result<Vec<Workflow>, ManagerError> {
        Ok(self.store.list_active_workflows().await?)
    }

    /// Rebuild every non-terminal workflow's in-memory dependency index
    /// after a process restart (spec.md §8 "crash recovery"). Call once
    /// at startup, before the engine starts dispatching.
    pub async fn recover(&self) -> Result<(), ManagerError> {
        for workflow in self.store.list_active_workflows().await? {
            self.engine.recover_workflow(&workflow.id).await?;
        }
        Ok(())
    }

    async fn fetch_workflow(&self, workflow_id: &str) -> Result<Workflow, ManagerError> {
        self.store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| ManagerError::WorkflowNotFound(workflow_id.to_string()))
    }
}

impl WorkflowObserver for WorkflowManager {
    /// Flip `pending -> running` the instant the first task of a
    /// workflow enters `executing` (spec.md §4.8). Done on a spawned task
    /// since this callback is invoked synchronously from inside the
    /// engine's dispatch path and must not block it on a `Store` round
    /// trip.
    fn on_task_started(&self, workflow_id: &str, _task_id: &str) {
        let store = self.store.clone();
        let workflow_id = workflow_id.to_string();
        tokio::spawn(async move {
            match store.get_workflow(&workflow_id).await {
                Ok(Some(workflow)) if workflow.status == WorkflowStatus::Pending => {
                    if let Err(err) = store.update_workflow_status(&workflow_id, WorkflowStatus::Running).await {
                        error!(workflow_id = %workflow_id, error = %err, "failed to mark workflow running");
                    }
                }
                Ok(_) => {}
                Err(err) => error!(workflow_id = %workflow_id, error = %err, "failed to load workflow"),
            }
        });
    }

    fn on_task_terminal(&self, workflow_id: &str, _task_id: &str, _status: TaskStatus) {
        let store = self.store.clone();
        let engine = self.engine.clone();
        let workflow_id = workflow_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = reconcile_workflow(&store, &engine, &workflow_id).await {
                error!(workflow_id = %workflow_id, error = %err, "workflow reconciliation failed");
            }
        });
    }
}

/// Apply spec.md §4.8's terminal-state rules to one workflow, given the
/// current status of all of its tasks:
///
/// - `stop`: `failed` the moment any task reaches `failed`; every other
///   non-terminal task is cancelled outright.
/// - `continue`: `failed` once every task is terminal and at least one
///   is `failed`.
/// - otherwise, once every task is terminal with none `failed`:
///   `completed`.
///
/// A workflow already terminal (e.g. `cancel_workflow` raced a task's
/// last notification) is left untouched.
async fn reconcile_workflow(
    store: &Arc<dyn Store>,
    engine: &Arc<ExecutionEngine>,
    workflow_id: &str,
) -> Result<(), ManagerError> {
    let Some(workflow) = store.get_workflow(workflow_id).await? else {
        return Ok(());
    };
    if workflow.status.is_terminal() {
        return Ok(());
    }

    let tasks = store.get_tasks_by_workflow(workflow_id).await?;
    let all_terminal = tasks.iter().all(|t: &Task| t.status.is_terminal());
    let any_failed = tasks.iter().any(|t: &Task| t.status == TaskStatus::Failed);

    if any_failed && workflow.error_strategy == ErrorStrategy::Stop {
        engine.cancel_non_terminal_tasks(workflow_id).await?;
        store.update_workflow_status(workflow_id, WorkflowStatus::Failed).await?;
    } else if all_terminal && any_failed {
        store.update_workflow_status(workflow_id, WorkflowStatus::Failed).await?;
    } else if all_terminal {
        store.update_workflow_status(workflow_id, WorkflowStatus::Completed).await?;
    }
    Ok(())
}
