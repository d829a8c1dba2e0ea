//! Workflow entity: a named DAG of tasks with a shared lifecycle
//! (spec.md §3 "Workflow").

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::TaskResult;
use crate::task::{Task, TaskId, TaskStatus, WorkflowId};

/// How the workflow reacts to a task failure (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    #[default]
    Stop,
    Continue,
}

/// Workflow lifecycle status (spec.md §3/§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// A named DAG of tasks with a shared lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub tasks: Vec<Task>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    /// Advisory cap on simultaneously executing tasks of this workflow
    /// (spec.md §3). Advisory: the engine's global `max_concurrent_tasks`
    /// bound is the only hard limit.
    #[serde(default)]
    pub max_parallel: Option<u32>,
    /// Free-form annotation fields, not interpreted by the core
    /// (SPEC_FULL.md §3 supplement, grounded in the original's `Workflow`
    /// model `tags`/`metadata` fields).
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(id: impl Into<WorkflowId>, name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            tasks,
            status: WorkflowStatus::Pending,
            error_strategy: ErrorStrategy::default(),
            max_parallel: None,
            tags: Vec::new(),
            metadata: Value::Null,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn task_ids(&self) -> BTreeSet<TaskId> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    /// Snapshot of workflow progress derived from the current set of
    /// `TaskResult`s plus each task's live status (spec.md §4.8
    /// `get_execution_status`). `current_statuses` carries the
    /// up-to-date status per task id (the `Task`s embedded in this
    /// `Workflow` are a point-in-time copy taken at submission and never
    /// refreshed); a cancelled task has no `TaskResult` but still counts
    /// toward `progress` reaching `1.0` once the workflow is terminal
    /// (spec.md §8: `|completed|+|failed|+|cancelled| = |tasks|` at
    /// terminal status).
    pub fn execution_status(
        &self,
        results: &BTreeMap<TaskId, TaskResult>,
        current_statuses: &BTreeMap<TaskId, TaskStatus>,
    ) -> ExecutionStatus {
        let total = self.tasks.len();
        let completed = self
            .tasks
            .iter()
            .filter(|t| results.get(&t.id).is_some_and(|r| r.is_completed()))
            .count();
        let failed = self
            .tasks
            .iter()
            .filter(|t| results.get(&t.id).is_some_and(|r| !r.is_completed()))
            .count();
        let cancelled = self
            .tasks
            .iter()
            .filter(|t| current_statuses.get(&t.id) == Some(&TaskStatus::Cancelled))
            .count();
        let progress = if total == 0 {
            1.0
        } else {
            (completed + failed + cancelled) as f64 / total as f64
        };
        ExecutionStatus {
            status: self.status,
            total_tasks: total,
            completed_tasks: completed,
            failed_tasks: failed,
            progress,
        }
    }
}

/// Aggregated workflow progress, as returned by `get_execution_status`
/// (spec.md §4.8).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub status: WorkflowStatus,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub progress: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[test]
    fn empty_workflow_has_full_progress() {
        let wf = Workflow::new("wf1", "empty", vec![]);
        let status = wf.execution_status(&BTreeMap::new(), &BTreeMap::new());
        assert_eq!(status.progress, 1.0);
        assert_eq!(status.total_tasks, 0);
    }

    #[test]
    fn progress_counts_completed_and_failed() {
        let t1 = Task::new("t1", "math/v1", "add");
        let t2 = Task::new("t2", "math/v1", "add");
        let wf = Workflow::new("wf1", "two-tasks", vec![t1, t2]);

        let mut results = BTreeMap::new();
        results.insert(
            "t1".to_string(),
            TaskResult::completed("t1", Some("wf1".into()), serde_json::json!({}), Utc::now(), 1),
        );

        let status = wf.execution_status(&results, &BTreeMap::new());
        assert_eq!(status.completed_tasks, 1);
        assert_eq!(status.failed_tasks, 0);
        assert_eq!(status.progress, 0.5);
    }

    #[test]
    fn progress_reaches_one_once_a_dependent_is_cancelled() {
        let t1 = Task::new("t1", "math/v1", "add");
        let t2 = Task::new("t2", "math/v1", "add");
        let wf = Workflow::new("wf1", "two-tasks", vec![t1, t2]);

        let mut results = BTreeMap::new();
        results.insert(
            "t1".to_string(),
            TaskResult::failed("t1", Some("wf1".into()), &crate::error::TaskError::system("X", "boom"), Utc::now(), 1),
        );
        let mut statuses = BTreeMap::new();
        statuses.insert("t2".to_string(), TaskStatus::Cancelled);

        let status = wf.execution_status(&results, &statuses);
        assert_eq!(status.failed_tasks, 1);
        assert_eq!(status.progress, 1.0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
    }
}
