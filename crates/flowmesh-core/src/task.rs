//! Task entity: one JSON-RPC invocation with dependency, priority and
//! retry metadata (spec.md §3 "Task").

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;

pub type TaskId = String;
pub type WorkflowId = String;

/// Execution priority. Numeric order (higher first) is used by the
/// priority queue (C2); `Ord`/`PartialOrd` follow this order directly so
/// a `BinaryHeap<(Priority, Reverse<u64>, TaskId)>` sorts correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    pub fn rank(self) -> u8 {
        self as u8
    }
}

/// Lifecycle status of a task. Transitions are monotone except for the
/// retry loop `executing -> failed -> retry_scheduled -> queued -> executing`
/// (spec.md §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Ready,
    Executing,
    Completed,
    Failed,
    RetryScheduled,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// Backoff shape used by the Retry Manager (C6) to compute delay between
/// attempts (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    #[default]
    Linear,
    Exponential,
}

/// Retry policy attached to a task. `base_delay`/`max_delay` are stored as
/// `Duration` but serialize as fractional seconds, matching the workflow
/// document's `base_delay: <number>` (seconds) field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    #[serde(with = "duration_seconds")]
    pub base_delay: Duration,
    #[serde(with = "duration_seconds")]
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_strategy: BackoffStrategy::Fixed,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Serde support for `Duration` as fractional seconds, mirroring the
/// teacher's millisecond variant (`reliability::circuit_breaker::duration_millis`)
/// but at the unit the workflow document uses.
pub mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }

    /// Variant for `Option<Duration>` fields, e.g. `Task::timeout`.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration.map(|d| d.as_secs_f64()).serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let secs: Option<f64> = Option::deserialize(deserializer)?;
            Ok(secs.map(|s| Duration::from_secs_f64(s.max(0.0))))
        }
    }
}

/// One JSON-RPC invocation, scheduled and tracked by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: Option<String>,
    pub workflow_id: Option<WorkflowId>,
    /// `name/vN`
    pub protocol: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_config: RetryConfig,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, with = "duration_seconds::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Default dispatch timeout when a task does not specify one (spec.md §4.7 step 5).
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

impl Task {
    pub fn new(id: impl Into<TaskId>, protocol: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            workflow_id: None,
            protocol: protocol.into(),
            method: method.into(),
            params: Value::Object(Default::default()),
            dependencies: BTreeSet::new(),
            priority: Priority::default(),
            status: TaskStatus::Pending,
            retry_config: RetryConfig::default(),
            attempt: 0,
            timeout: None,
            worker_id: None,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TASK_TIMEOUT)
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.retry_config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_urgent_highest() {
        let mut ps = vec![Priority::Low, Priority::Urgent, Priority::Normal, Priority::High];
        ps.sort();
        assert_eq!(ps, vec![Priority::Low, Priority::Normal, Priority::High, Priority::Urgent]);
    }

    #[test]
    fn task_status_terminal_set() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::RetryScheduled.is_terminal());
    }

    #[test]
    fn default_timeout_applies_when_unset() {
        let task = Task::new("t1", "math/v1", "add");
        assert_eq!(task.effective_timeout(), DEFAULT_TASK_TIMEOUT);
    }

    #[test]
    fn retry_config_round_trips_through_json() {
        let cfg = RetryConfig::exponential(3, Duration::from_secs(1), Duration::from_secs(30));
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: RetryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, parsed);
    }
}
