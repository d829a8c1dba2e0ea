//! Retry manager (C6, spec.md §4.6).
//!
//! Decides, given a task's retry policy and the error it just failed
//! with, whether to schedule another attempt and at what delay. Delay
//! formulas and the jitter window are grounded on the teacher's
//! `reliability/retry.rs` `RetryPolicy::delay_for_attempt`, generalized
//! from the teacher's single `backoff_coefficient` knob into this spec's
//! three named strategies (fixed/linear/exponential, spec.md §4.6).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;

use flowmesh_core::{BackoffStrategy, RetryConfig, Task, TaskError};
use flowmesh_persistence::{Store, StoreError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RetryError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Uniform jitter window applied to the computed delay, spec.md §4.6:
/// "jitter, when enabled, scales the capped delay by a value drawn
/// uniformly from [0.5, 1.5]".
const JITTER_LOW: f64 = 0.5;
const JITTER_HIGH: f64 = 1.5;

/// Compute the backoff delay for the attempt just made (1-based: `attempt
/// == 1` is the delay scheduled after the first failure), per strategy:
///
/// - `Fixed`: always `base_delay`.
/// - `Linear`: `base_delay * attempt`.
/// - `Exponential`: `base_delay * 2^(attempt - 1)`.
///
/// The result is clamped to `[0, max_delay]` before jitter is applied, so
/// jitter can still push a capped delay up to `1.5 * max_delay`.
pub fn compute_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let raw = match cfg.backoff_strategy {
        BackoffStrategy::Fixed => cfg.base_delay,
        BackoffStrategy::Linear => cfg.base_delay.saturating_mul(attempt.max(1)),
        BackoffStrategy::Exponential => {
            let exponent = attempt.saturating_sub(1).min(32);
            cfg.base_delay.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
        }
    };
    let capped = raw.min(cfg.max_delay);
    if cfg.jitter {
        let factor = rand::thread_rng().gen_range(JITTER_LOW..=JITTER_HIGH);
        capped.mul_f64(factor)
    } else {
        capped
    }
}

/// Schedules retries for failed tasks against `Store`'s retry table.
pub struct RetryManager {
    store: Arc<dyn Store>,
}

impl RetryManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Decide whether `task` (whose `attempt` counter already reflects
    /// the attempt that just failed) gets another try, and if so persist
    /// the scheduled fire time. Returns `false` when attempts are
    /// exhausted or the error's category is not retryable (spec.md §4.6:
    /// "check attempts remaining and error retryability before computing
    /// any delay").
    pub async fn schedule_retry(&self, task: &Task, error: &TaskError) -> Result<bool, RetryError> {
        if !task.has_attempts_remaining() || !error.is_retryable() {
            return Ok(false);
        }
        let delay = compute_delay(&task.retry_config, task.attempt);
        let fire_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.store.schedule_retry(&task.id, fire_at).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmesh_persistence::InMemoryStore;

    fn task_with(cfg: RetryConfig, attempt: u32) -> Task {
        let mut t = Task::new("t1", "math/v1", "add");
        t.retry_config = cfg;
        t.attempt = attempt;
        t
    }

    #[test]
    fn fixed_strategy_always_returns_base_delay() {
        let cfg = RetryConfig {
            max_attempts: 5,
            backoff_strategy: BackoffStrategy::Fixed,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: false,
        };
        assert_eq!(compute_delay(&cfg, 1), Duration::from_secs(2));
        assert_eq!(compute_delay(&cfg, 4), Duration::from_secs(2));
    }

    #[test]
    fn linear_strategy_scales_with_attempt() {
        let cfg = RetryConfig {
            max_attempts: 5,
            backoff_strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: false,
        };
        assert_eq!(compute_delay(&cfg, 1), Duration::from_secs(1));
        assert_eq!(compute_delay(&cfg, 3), Duration::from_secs(3));
    }

    #[test]
    fn exponential_strategy_doubles_each_attempt() {
        let cfg = RetryConfig {
            max_attempts: 5,
            backoff_strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: false,
        };
        assert_eq!(compute_delay(&cfg, 1), Duration::from_secs(1));
        assert_eq!(compute_delay(&cfg, 2), Duration::from_secs(2));
        assert_eq!(compute_delay(&cfg, 3), Duration::from_secs(4));
    }

    #[test]
    fn delay_never_exceeds_max_delay_before_jitter() {
        let cfg = RetryConfig {
            max_attempts: 10,
            backoff_strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: false,
        };
        assert_eq!(compute_delay(&cfg, 10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn exhausted_attempts_are_not_retried() {
        let manager = RetryManager::new(Arc::new(InMemoryStore::new()));
        let task = task_with(RetryConfig::fixed(3, Duration::from_secs(1)), 3);
        let err = TaskError::transient("PROVIDER_TIMEOUT", "down");
        assert!(!manager.schedule_retry(&task, &err).await.unwrap());
    }

    #[tokio::test]
    async fn non_retryable_category_is_never_retried() {
        let manager = RetryManager::new(Arc::new(InMemoryStore::new()));
        let task = task_with(RetryConfig::fixed(3, Duration::from_secs(1)), 1);
        let err = TaskError::validation("INVALID_PARAMS", "bad shape");
        assert!(!manager.schedule_retry(&task, &err).await.unwrap());
    }

    #[tokio::test]
    async fn retryable_failure_with_attempts_left_schedules_a_retry() {
        let store = Arc::new(InMemoryStore::new());
        let manager = RetryManager::new(store.clone());
        let task = task_with(RetryConfig::fixed(3, Duration::from_millis(1)), 1);
        let err = TaskError::transient("PROVIDER_TIMEOUT", "down");
        assert!(manager.schedule_retry(&task, &err).await.unwrap());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let due = store.pop_due_retries(Utc::now()).await.unwrap();
        assert_eq!(due, vec!["t1".to_string()]);
    }

    proptest::proptest! {
        #[test]
        fn delay_is_always_within_jittered_bounds(
            attempt in 1u32..20,
            base_ms in 1u64..5000,
            max_ms in 1u64..60000,
        ) {
            let cfg = RetryConfig {
                max_attempts: 20,
                backoff_strategy: BackoffStrategy::Exponential,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                jitter: true,
            };
            let delay = compute_delay(&cfg, attempt);
            prop_assert!(delay.as_secs_f64() <= cfg.max_delay.as_secs_f64() * JITTER_HIGH + 1e-6);
            prop_assert!(delay.as_secs_f64() >= 0.0);
        }
    }
}
