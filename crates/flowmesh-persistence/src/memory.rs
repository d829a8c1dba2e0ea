//! In-memory `Store` implementation.
//!
//! Grounded directly on the teacher's `InMemoryWorkflowEventStore`
//! (`crates/durable/src/persistence/memory.rs`): the same `parking_lot`
//! lock-per-table layout, traded for our task/result/workflow/queue
//! tables instead of the teacher's event-sourced workflow/task tables.
//! Intended for tests and the demo binary, not production use.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use flowmesh_core::{Priority, Task, TaskId, TaskResult, TaskStatus, Workflow, WorkflowId, WorkflowStatus};

use crate::store::{DeadLetterEntry, Store, StoreError, WorkerInfo};

#[derive(Debug, Clone)]
struct QueueEntry {
    task_id: TaskId,
    priority: Priority,
    enqueue_time: DateTime<Utc>,
}

/// Thread-safe, process-local `Store`. Each table is an independent
/// `parking_lot::RwLock`, matching the teacher's lock-per-table
/// granularity rather than one lock over a combined struct.
#[derive(Default)]
pub struct InMemoryStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    results: RwLock<HashMap<TaskId, TaskResult>>,
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
    queues: RwLock<HashMap<String, Vec<QueueEntry>>>,
    retry_schedule: RwLock<Vec<(DateTime<Utc>, TaskId)>>,
    dead_letters: RwLock<Vec<DeadLetterEntry>>,
    workers: RwLock<HashMap<String, WorkerInfo>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks.write().insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().get(id).cloned())
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(id).ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;
        task.status = status;
        Ok(())
    }

    async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        Ok(self.tasks.read().values().filter(|t| t.status == status).cloned().collect())
    }

    async fn get_tasks_by_workflow(&self, workflow_id: &str) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.workflow_id.as_deref() == Some(workflow_id))
            .cloned()
            .collect())
    }

    async fn get_all_queued_tasks(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Queued || t.status == TaskStatus::Ready)
            .cloned()
            .collect())
    }

    async fn save_task_result(&self, result: &TaskResult) -> Result<(), StoreError> {
        self.results.write().insert(result.task_id.clone(), result.clone());
        Ok(())
    }

    async fn get_task_result(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError> {
        Ok(self.results.read().get(task_id).cloned())
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.workflows.write().insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        Ok(self.workflows.read().get(id).cloned())
    }

    async fn update_workflow_status(&self, id: &str, status: WorkflowStatus) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(id)
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))?;
        workflow.status = status;
        if status.is_terminal() {
            workflow.completed_at = Some(Utc::now());
        } else if status == WorkflowStatus::Running && workflow.started_at.is_none() {
            workflow.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_active_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        Ok(self
            .workflows
            .read()
            .values()
            .filter(|w| !w.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn enqueue(
        &self,
        queue_name: &str,
        task_id: &str,
        priority: Priority,
        enqueue_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.queues.write().entry(queue_name.to_string()).or_default().push(QueueEntry {
            task_id: task_id.to_string(),
            priority,
            enqueue_time,
        });
        Ok(())
    }

    async fn dequeue_highest_priority(&self, queue_name: &str) -> Result<Option<TaskId>, StoreError> {
        let mut queues = self.queues.write();
        let Some(entries) = queues.get_mut(queue_name) else {
            return Ok(None);
        };
        if entries.is_empty() {
            return Ok(None);
        }
        // Highest priority first, then FIFO (earliest enqueue_time) within
        // a priority band (spec.md §4.2 ordering invariant).
        let best = entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.enqueue_time.cmp(&a.enqueue_time))
            })
            .map(|(idx, _)| idx);
        Ok(best.map(|idx| entries.remove(idx).task_id))
    }

    async fn queue_size(&self, queue_name: &str) -> Result<usize, StoreError> {
        Ok(self.queues.read().get(queue_name).map(|e| e.len()).unwrap_or(0))
    }

    async fn schedule_retry(&self, task_id: &str, fire_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.retry_schedule.write().push((fire_at, task_id.to_string()));
        Ok(())
    }

    async fn pop_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        let mut schedule = self.retry_schedule.write();
        let (due, pending): (Vec<_>, Vec<_>) = schedule.drain(..).partition(|(fire_at, _)| *fire_at <= now);
        *schedule = pending;
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn get_task_count_by_status(&self) -> Result<HashMap<TaskStatus, usize>, StoreError> {
        let mut counts: HashMap<TaskStatus, usize> = HashMap::new();
        for task in self.tasks.read().values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        self.dead_letters.write().push(entry.clone());
        Ok(())
    }

    async fn list_dead_letters(&self, workflow_id: Option<&str>) -> Result<Vec<DeadLetterEntry>, StoreError> {
        Ok(self
            .dead_letters
            .read()
            .iter()
            .filter(|e| workflow_id.is_none_or(|wf| e.workflow_id.as_deref() == Some(wf)))
            .cloned()
            .collect())
    }

    async fn register_worker(&self, worker_id: &str, worker_group: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        self.workers.write().insert(
            worker_id.to_string(),
            WorkerInfo {
                worker_id: worker_id.to_string(),
                worker_group: worker_group.to_string(),
                registered_at: now,
                last_heartbeat: now,
                claimed_task_ids: Vec::new(),
            },
        );
        Ok(())
    }

    async fn heartbeat_worker(&self, worker_id: &str, claimed_task_ids: Vec<TaskId>) -> Result<(), StoreError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::Backend(format!("unknown worker: {worker_id}")))?;
        worker.last_heartbeat = Utc::now();
        worker.claimed_task_ids = claimed_task_ids;
        Ok(())
    }

    async fn list_stale_workers(&self, stale_after: DateTime<Utc>) -> Result<Vec<WorkerInfo>, StoreError> {
        Ok(self
            .workers
            .read()
            .values()
            .filter(|w| w.last_heartbeat < stale_after)
            .cloned()
            .collect())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        self.workers.write().remove(worker_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmesh_core::Task;

    #[tokio::test]
    async fn save_and_get_task_round_trips() {
        let store = InMemoryStore::new();
        let task = Task::new("t1", "math/v1", "add");
        store.save_task(&task).await.unwrap();
        let fetched = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "t1");
    }

    #[tokio::test]
    async fn dequeue_respects_priority_then_fifo() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        store.enqueue("default", "low", Priority::Low, t0).await.unwrap();
        store
            .enqueue("default", "urgent-first", Priority::Urgent, t0 + chrono::Duration::seconds(1))
            .await
            .unwrap();
        store
            .enqueue("default", "urgent-second", Priority::Urgent, t0 + chrono::Duration::seconds(2))
            .await
            .unwrap();

        assert_eq!(store.dequeue_highest_priority("default").await.unwrap(), Some("urgent-first".to_string()));
        assert_eq!(store.dequeue_highest_priority("default").await.unwrap(), Some("urgent-second".to_string()));
        assert_eq!(store.dequeue_highest_priority("default").await.unwrap(), Some("low".to_string()));
        assert_eq!(store.dequeue_highest_priority("default").await.unwrap(), None);
    }

    #[tokio::test]
    async fn pop_due_retries_only_returns_elapsed_entries() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.schedule_retry("t1", now - chrono::Duration::seconds(5)).await.unwrap();
        store.schedule_retry("t2", now + chrono::Duration::seconds(60)).await.unwrap();

        let due = store.pop_due_retries(now).await.unwrap();
        assert_eq!(due, vec!["t1".to_string()]);
        assert_eq!(store.pop_due_retries(now).await.unwrap(), Vec::<TaskId>::new());
    }

    #[tokio::test]
    async fn stale_worker_detection() {
        let store = InMemoryStore::new();
        store.register_worker("w1", "default").await.unwrap();
        let far_future = Utc::now() + chrono::Duration::seconds(3600);
        let stale = store.list_stale_workers(far_future).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].worker_id, "w1");
    }
}
