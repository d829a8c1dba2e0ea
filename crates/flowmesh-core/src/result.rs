//! TaskResult entity (spec.md §3 "TaskResult").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;
use crate::task::{TaskId, WorkflowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

/// The outcome of one terminal dispatch attempt. Written exactly once per
/// terminal attempt; a subsequent retry attempt overwrites the prior
/// result for the same `task_id` (spec.md §3 invariant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub workflow_id: Option<WorkflowId>,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub attempt: u32,
}

impl TaskResult {
    pub fn completed(
        task_id: impl Into<TaskId>,
        workflow_id: Option<WorkflowId>,
        result: Value,
        started_at: DateTime<Utc>,
        attempt: u32,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            workflow_id,
            status: ResultStatus::Completed,
            result: Some(result),
            error: None,
            started_at,
            completed_at: Utc::now(),
            attempt,
        }
    }

    pub fn failed(
        task_id: impl Into<TaskId>,
        workflow_id: Option<WorkflowId>,
        error: &TaskError,
        started_at: DateTime<Utc>,
        attempt: u32,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            workflow_id,
            status: ResultStatus::Failed,
            result: None,
            error: Some(error.to_string()),
            started_at,
            completed_at: Utc::now(),
            attempt,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ResultStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use serde_json::json;

    #[test]
    fn completed_carries_result_not_error() {
        let r = TaskResult::completed("t1", None, json!({"sum": 5}), Utc::now(), 1);
        assert!(r.result.is_some());
        assert!(r.error.is_none());
        assert!(r.is_completed());
    }

    #[test]
    fn failed_carries_error_not_result() {
        let err = TaskError::timeout("PROVIDER_TIMEOUT", "exceeded 60s");
        let r = TaskResult::failed("t1", None, &err, Utc::now(), 2);
        assert!(r.result.is_none());
        assert!(r.error.is_some());
        assert!(!r.is_completed());
    }

    #[test]
    fn round_trips_through_json() {
        let r = TaskResult::completed("t1", Some("wf1".into()), json!({"ok": true}), Utc::now(), 1);
        let s = serde_json::to_string(&r).unwrap();
        let parsed: TaskResult = serde_json::from_str(&s).unwrap();
        assert_eq!(r, parsed);
    }
}
