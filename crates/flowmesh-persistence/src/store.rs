//! `Store` trait: the durable persistence contract (spec.md §4.1).
//!
//! Generalizes the teacher's `WorkflowEventStore`
//! (`crates/durable/src/persistence/store.rs`) from an event-sourced
//! workflow/activity store into the task/result/workflow/queue/retry
//! contract this spec names directly. Any backend — in-memory, embedded
//! file-DB, networked KV — is acceptable as long as it honors the
//! atomicity guarantees below (spec.md §4.1).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use flowmesh_core::{Priority, Task, TaskId, TaskResult, TaskStatus, Workflow, WorkflowId, WorkflowStatus};

/// Errors from store operations. Transient backend failures bubble up as
/// `Backend`; callers above treat any `StoreError` as fatal for the
/// current task (spec.md §4.1 failure semantics) — the task is found in
/// a non-terminal state after restart and re-dispatched.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A task that exhausted `retry_config.max_attempts`, recorded for
/// operational visibility only (SPEC_FULL.md §2/§3 supplement, grounded
/// in the teacher's `DlqEntry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task_id: TaskId,
    pub workflow_id: Option<WorkflowId>,
    pub final_error: String,
    pub attempt: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// A registered worker in C7's pool (SPEC_FULL.md §2/§3 supplement,
/// grounded in the teacher's `WorkerInfo`/`WorkerFilter`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub worker_group: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub claimed_task_ids: Vec<TaskId>,
}

/// Durable persistence contract (C1). Implementations must be
/// thread-safe and honor the write-atomicity guarantees from spec.md
/// §4.1: no torn reads of a partially updated task, and a committed
/// `TaskResult` implies a committed terminal status.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // Task operations ------------------------------------------------
    async fn save_task(&self, task: &Task) -> Result<(), StoreError>;
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;
    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError>;
    async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError>;
    async fn get_tasks_by_workflow(&self, workflow_id: &str) -> Result<Vec<Task>, StoreError>;
    async fn get_all_queued_tasks(&self) -> Result<Vec<Task>, StoreError>;

    // Result operations ------------------------------------------------
    async fn save_task_result(&self, result: &TaskResult) -> Result<(), StoreError>;
    async fn get_task_result(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError>;

    // Workflow operations ------------------------------------------------
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError>;
    async fn update_workflow_status(&self, id: &str, status: WorkflowStatus) -> Result<(), StoreError>;
    async fn list_active_workflows(&self) -> Result<Vec<Workflow>, StoreError>;

    // Queue operations ------------------------------------------------
    async fn enqueue(
        &self,
        queue_name: &str,
        task_id: &str,
        priority: Priority,
        enqueue_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn dequeue_highest_priority(&self, queue_name: &str) -> Result<Option<TaskId>, StoreError>;
    async fn queue_size(&self, queue_name: &str) -> Result<usize, StoreError>;

    // Retry schedule ------------------------------------------------
    async fn schedule_retry(&self, task_id: &str, fire_at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn pop_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError>;

    async fn get_task_count_by_status(&self) -> Result<HashMap<TaskStatus, usize>, StoreError>;

    // Dead letter queue (SPEC_FULL.md §2 supplement) ------------------
    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError>;
    async fn list_dead_letters(&self, workflow_id: Option<&str>) -> Result<Vec<DeadLetterEntry>, StoreError>;

    // Worker registry (SPEC_FULL.md §2 supplement) ------------------
    async fn register_worker(&self, worker_id: &str, worker_group: &str) -> Result<(), StoreError>;
    async fn heartbeat_worker(&self, worker_id: &str, claimed_task_ids: Vec<TaskId>) -> Result<(), StoreError>;
    async fn list_stale_workers(&self, stale_after: DateTime<Utc>) -> Result<Vec<WorkerInfo>, StoreError>;
    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError>;
}
