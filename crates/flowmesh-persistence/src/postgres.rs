//! PostgreSQL `Store` implementation.
//!
//! Grounded on the teacher's `PostgresWorkflowEventStore`
//! (`crates/durable/src/persistence/postgres.rs`): a `PgPool` held
//! behind a cheap `Clone` wrapper, raw `sqlx::query` with manual
//! `row.get(...)` extraction rather than the `query!` macro (so this
//! compiles without a live database for `cargo sqlx prepare`), and
//! `FOR UPDATE SKIP LOCKED` for contention-free queue dequeue. Assumes
//! the `flowmesh_*` tables already exist; this crate ships no migration
//! runner, matching the teacher (no migrations directory in `durable`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use flowmesh_core::{Priority, Task, TaskId, TaskResult, TaskStatus, Workflow, WorkflowId, WorkflowStatus};

use crate::store::{DeadLetterEntry, Store, StoreError, WorkerInfo};

/// Postgres-backed `Store`. Cheap to clone; internally an `Arc`-pooled
/// `PgPool` (sqlx handles the pool's own internal sharing).
///
/// # Example
///
/// ```ignore
/// use flowmesh_persistence::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/flowmesh").await?;
/// let store = PostgresStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_task_status(s: &str) -> Result<TaskStatus, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| StoreError::Serialization(format!("invalid task status '{s}': {e}")))
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Queued => "queued",
        TaskStatus::Ready => "ready",
        TaskStatus::Executing => "executing",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::RetryScheduled => "retry_scheduled",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn parse_workflow_status(s: &str) -> Result<WorkflowStatus, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| StoreError::Serialization(format!("invalid workflow status '{s}': {e}")))
}

fn workflow_status_str(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Pending => "pending",
        WorkflowStatus::Running => "running",
        WorkflowStatus::Completed => "completed",
        WorkflowStatus::Failed => "failed",
        WorkflowStatus::Cancelled => "cancelled",
    }
}

fn priority_rank(priority: Priority) -> i32 {
    priority.rank() as i32
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task, StoreError> {
    let status_str: String = row.get("status");
    let priority_str: String = row.get("priority");
    let dependencies_json: serde_json::Value = row.get("dependencies");
    let retry_config_json: serde_json::Value = row.get("retry_config");
    let last_error_json: Option<serde_json::Value> = row.get("last_error");

    Ok(Task {
        id: row.get("id"),
        name: row.get("name"),
        workflow_id: row.get("workflow_id"),
        protocol: row.get("protocol"),
        method: row.get("method"),
        params: row.get("params"),
        dependencies: serde_json::from_value(dependencies_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        priority: serde_json::from_value(serde_json::Value::String(priority_str))
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        status: parse_task_status(&status_str)?,
        retry_config: serde_json::from_value(retry_config_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        attempt: row.get::<i32, _>("attempt") as u32,
        timeout: row.get::<Option<f64>, _>("timeout_secs").map(std::time::Duration::from_secs_f64),
        worker_id: row.get("worker_id"),
        last_error: last_error_json
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self, task))]
    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        let dependencies = serde_json::to_value(&task.dependencies).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let retry_config = serde_json::to_value(&task.retry_config).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let last_error = task.last_error.as_ref().map(serde_json::to_value).transpose().map_err(|e| StoreError::Serialization(e.to_string()))?;
        let priority = format!("{:?}", task.priority).to_lowercase();

        sqlx::query(
            r#"
            INSERT INTO flowmesh_tasks
                (id, name, workflow_id, protocol, method, params, dependencies, priority,
                 status, retry_config, attempt, timeout_secs, worker_id, last_error,
                 created_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                attempt = EXCLUDED.attempt,
                worker_id = EXCLUDED.worker_id,
                last_error = EXCLUDED.last_error,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.workflow_id)
        .bind(&task.protocol)
        .bind(&task.method)
        .bind(&task.params)
        .bind(&dependencies)
        .bind(&priority)
        .bind(task_status_str(task.status))
        .bind(&retry_config)
        .bind(task.attempt as i32)
        .bind(task.timeout.map(|d| d.as_secs_f64()))
        .bind(&task.worker_id)
        .bind(&last_error)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to save task: {e}");
            StoreError::Backend(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM flowmesh_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.as_ref().map(row_to_task).transpose()
    }

    #[instrument(skip(self))]
    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE flowmesh_tasks SET status = $1 WHERE id = $2")
            .bind(task_status_str(status))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        debug!(%id, ?status, "updated task status");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM flowmesh_tasks WHERE status = $1")
            .bind(task_status_str(status))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn get_tasks_by_workflow(&self, workflow_id: &str) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM flowmesh_tasks WHERE workflow_id = $1")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn get_all_queued_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM flowmesh_tasks WHERE status IN ('queued', 'ready')")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self, result))]
    async fn save_task_result(&self, result: &TaskResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flowmesh_task_results
                (task_id, workflow_id, status, result, error, started_at, completed_at, attempt)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (task_id) DO UPDATE SET
                status = EXCLUDED.status,
                result = EXCLUDED.result,
                error = EXCLUDED.error,
                completed_at = EXCLUDED.completed_at,
                attempt = EXCLUDED.attempt
            "#,
        )
        .bind(&result.task_id)
        .bind(&result.workflow_id)
        .bind(format!("{:?}", result.status).to_lowercase())
        .bind(&result.result)
        .bind(&result.error)
        .bind(result.started_at)
        .bind(result.completed_at)
        .bind(result.attempt as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_task_result(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError> {
        let row = sqlx::query("SELECT * FROM flowmesh_task_results WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let Some(row) = row else { return Ok(None) };
        let status_str: String = row.get("status");
        let status = serde_json::from_value(serde_json::Value::String(status_str))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(TaskResult {
            task_id: row.get("task_id"),
            workflow_id: row.get("workflow_id"),
            status,
            result: row.get("result"),
            error: row.get("error"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            attempt: row.get::<i32, _>("attempt") as u32,
        }))
    }

    #[instrument(skip(self, workflow))]
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flowmesh_workflows
                (id, name, description, status, error_strategy, max_parallel, tags, metadata,
                 created_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow_status_str(workflow.status))
        .bind(format!("{:?}", workflow.error_strategy).to_lowercase())
        .bind(workflow.max_parallel.map(|v| v as i32))
        .bind(serde_json::to_value(&workflow.tags).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(&workflow.metadata)
        .bind(workflow.created_at)
        .bind(workflow.started_at)
        .bind(workflow.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        for task in &workflow.tasks {
            self.save_task(task).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query("SELECT * FROM flowmesh_workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let Some(row) = row else { return Ok(None) };

        let status_str: String = row.get("status");
        let tags_json: serde_json::Value = row.get("tags");
        let tasks = self.get_tasks_by_workflow(id).await?;

        Ok(Some(Workflow {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            tasks,
            status: parse_workflow_status(&status_str)?,
            error_strategy: serde_json::from_value(serde_json::Value::String(row.get("error_strategy")))
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            max_parallel: row.get::<Option<i32>, _>("max_parallel").map(|v| v as u32),
            tags: serde_json::from_value(tags_json).map_err(|e| StoreError::Serialization(e.to_string()))?,
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        }))
    }

    #[instrument(skip(self))]
    async fn update_workflow_status(&self, id: &str, status: WorkflowStatus) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE flowmesh_workflows SET
                status = $1,
                started_at = CASE WHEN $2 AND started_at IS NULL THEN $3 ELSE started_at END,
                completed_at = CASE WHEN $4 THEN $3 ELSE completed_at END
            WHERE id = $5
            "#,
        )
        .bind(workflow_status_str(status))
        .bind(status == WorkflowStatus::Running)
        .bind(now)
        .bind(status.is_terminal())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_active_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query("SELECT id FROM flowmesh_workflows WHERE status IN ('pending', 'running')")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut workflows = Vec::with_capacity(rows.len());
        for row in rows {
            let id: WorkflowId = row.get("id");
            if let Some(workflow) = self.get_workflow(&id).await? {
                workflows.push(workflow);
            }
        }
        Ok(workflows)
    }

    #[instrument(skip(self))]
    async fn enqueue(
        &self,
        queue_name: &str,
        task_id: &str,
        priority: Priority,
        enqueue_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flowmesh_queue (queue_name, task_id, priority, enqueue_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (queue_name, task_id) DO NOTHING
            "#,
        )
        .bind(queue_name)
        .bind(task_id)
        .bind(priority_rank(priority))
        .bind(enqueue_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    /// `FOR UPDATE SKIP LOCKED` so concurrent workers never block on each
    /// other's in-flight dequeue (teacher: `claim_task`'s `claimable` CTE).
    #[instrument(skip(self))]
    async fn dequeue_highest_priority(&self, queue_name: &str) -> Result<Option<TaskId>, StoreError> {
        let row = sqlx::query(
            r#"
            WITH next_entry AS (
                SELECT task_id
                FROM flowmesh_queue
                WHERE queue_name = $1
                ORDER BY priority DESC, enqueue_time ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            DELETE FROM flowmesh_queue
            WHERE queue_name = $1 AND task_id = (SELECT task_id FROM next_entry)
            RETURNING task_id
            "#,
        )
        .bind(queue_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(row.map(|r| r.get("task_id")))
    }

    #[instrument(skip(self))]
    async fn queue_size(&self, queue_name: &str) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM flowmesh_queue WHERE queue_name = $1")
            .bind(queue_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(row.get::<i64, _>("n") as usize)
    }

    #[instrument(skip(self))]
    async fn schedule_retry(&self, task_id: &str, fire_at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flowmesh_retry_schedule (task_id, fire_at)
            VALUES ($1, $2)
            ON CONFLICT (task_id) DO UPDATE SET fire_at = EXCLUDED.fire_at
            "#,
        )
        .bind(task_id)
        .bind(fire_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pop_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM flowmesh_retry_schedule
            WHERE task_id IN (
                SELECT task_id FROM flowmesh_retry_schedule
                WHERE fire_at <= $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING task_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get("task_id")).collect())
    }

    #[instrument(skip(self))]
    async fn get_task_count_by_status(&self) -> Result<std::collections::HashMap<TaskStatus, usize>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM flowmesh_tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut counts = std::collections::HashMap::new();
        for row in rows {
            let status_str: String = row.get("status");
            let status = parse_task_status(&status_str)?;
            counts.insert(status, row.get::<i64, _>("n") as usize);
        }
        Ok(counts)
    }

    #[instrument(skip(self, entry))]
    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flowmesh_dead_letters
                (task_id, workflow_id, final_error, attempt, dead_lettered_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&entry.task_id)
        .bind(&entry.workflow_id)
        .bind(&entry.final_error)
        .bind(entry.attempt as i32)
        .bind(entry.dead_lettered_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_dead_letters(&self, workflow_id: Option<&str>) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows = match workflow_id {
            Some(wf) => sqlx::query("SELECT * FROM flowmesh_dead_letters WHERE workflow_id = $1 ORDER BY dead_lettered_at DESC")
                .bind(wf)
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query("SELECT * FROM flowmesh_dead_letters ORDER BY dead_lettered_at DESC")
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.iter()
            .map(|row| {
                Ok(DeadLetterEntry {
                    task_id: row.get("task_id"),
                    workflow_id: row.get("workflow_id"),
                    final_error: row.get("final_error"),
                    attempt: row.get::<i32, _>("attempt") as u32,
                    dead_lettered_at: row.get("dead_lettered_at"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn register_worker(&self, worker_id: &str, worker_group: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO flowmesh_workers (worker_id, worker_group, registered_at, last_heartbeat, claimed_task_ids)
            VALUES ($1, $2, $3, $3, '[]'::jsonb)
            ON CONFLICT (worker_id) DO UPDATE SET last_heartbeat = EXCLUDED.last_heartbeat
            "#,
        )
        .bind(worker_id)
        .bind(worker_group)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn heartbeat_worker(&self, worker_id: &str, claimed_task_ids: Vec<TaskId>) -> Result<(), StoreError> {
        let claimed = serde_json::to_value(&claimed_task_ids).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE flowmesh_workers SET last_heartbeat = $1, claimed_task_ids = $2 WHERE worker_id = $3
            "#,
        )
        .bind(Utc::now())
        .bind(&claimed)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Backend(format!("unknown worker: {worker_id}")));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_stale_workers(&self, stale_after: DateTime<Utc>) -> Result<Vec<WorkerInfo>, StoreError> {
        let rows = sqlx::query("SELECT * FROM flowmesh_workers WHERE last_heartbeat < $1")
            .bind(stale_after)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.iter()
            .map(|row| {
                let claimed_json: serde_json::Value = row.get("claimed_task_ids");
                Ok(WorkerInfo {
                    worker_id: row.get("worker_id"),
                    worker_group: row.get("worker_group"),
                    registered_at: row.get("registered_at"),
                    last_heartbeat: row.get("last_heartbeat"),
                    claimed_task_ids: serde_json::from_value(claimed_json).map_err(|e| StoreError::Serialization(e.to_string()))?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM flowmesh_workers WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}
