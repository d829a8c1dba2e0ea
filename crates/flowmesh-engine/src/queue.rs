//! Priority queue (C2, spec.md §4.2).
//!
//! A thin, stateless wrapper over `Store`'s queue table: it knows nothing
//! about dependencies or task bodies, only `(task_id, priority)` ordering.
//! Multiple named instances can share one `Store` (spec.md §4.2 "supports
//! multiple named queue instances; callers default to one shared queue").
//! Grounded on the teacher's own preference for pushing ordering logic into
//! the store (`persistence/store.rs`'s `claim_task` `ORDER BY` clause)
//! rather than re-implementing a heap in the queue layer.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use flowmesh_core::{Priority, TaskId};
use flowmesh_persistence::{Store, StoreError};

/// Name of the queue used when a caller does not register its own.
pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub size: usize,
}

/// One named priority queue backed by `Store`.
pub struct PriorityQueue {
    store: Arc<dyn Store>,
    name: String,
}

impl PriorityQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::named(store, DEFAULT_QUEUE)
    }

    pub fn named(store: Arc<dyn Store>, name: impl Into<String>) -> Self {
        Self { store, name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue `task_id` at `priority`. Idempotent in the sense that
    /// calling it twice for the same task simply creates two queue
    /// entries; callers (the Execution Engine) are responsible for only
    /// enqueueing a task once per dispatch-eligible transition.
    pub async fn enqueue(&self, task_id: &str, priority: Priority) -> Result<(), QueueError> {
        self.store.enqueue(&self.name, task_id, priority, Utc::now()).await?;
        Ok(())
    }

    /// Pop the next task: highest priority first, FIFO within a priority
    /// band (spec.md §4.2 ordering invariant, enforced by the `Store`
    /// implementation). Returns `None` when the queue is empty.
    pub async fn dequeue(&self) -> Result<Option<TaskId>, QueueError> {
        Ok(self.store.dequeue_highest_priority(&self.name).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats { size: self.store.queue_size(&self.name).await? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmesh_persistence::InMemoryStore;

    #[tokio::test]
    async fn dequeues_highest_priority_first() {
        let queue = PriorityQueue::new(Arc::new(InMemoryStore::new()));
        queue.enqueue("low", Priority::Low).await.unwrap();
        queue.enqueue("urgent", Priority::Urgent).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap(), Some("urgent".to_string()));
        assert_eq!(queue.dequeue().await.unwrap(), Some("low".to_string()));
        assert_eq!(queue.dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn stats_report_current_size() {
        let queue = PriorityQueue::new(Arc::new(InMemoryStore::new()));
        queue.enqueue("t1", Priority::Normal).await.unwrap();
        queue.enqueue("t2", Priority::Normal).await.unwrap();
        assert_eq!(queue.stats().await.unwrap().size, 2);
        queue.dequeue().await.unwrap();
        assert_eq!(queue.stats().await.unwrap().size, 1);
    }

    #[tokio::test]
    async fn named_queues_are_independent() {
        let store = Arc::new(InMemoryStore::new());
        let a = PriorityQueue::named(store.clone(), "a");
        let b = PriorityQueue::named(store, "b");
        a.enqueue("only-in-a", Priority::Normal).await.unwrap();
        assert_eq!(b.dequeue().await.unwrap(), None);
        assert_eq!(a.dequeue().await.unwrap(), Some("only-in-a".to_string()));
    }
}
