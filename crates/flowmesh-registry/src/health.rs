//! Per-provider health tracking (spec.md §4.3).
//!
//! Reuses the teacher's `CircuitState`/`CircuitBreakerConfig` shape
//! (`crates/durable/src/reliability/circuit_breaker.rs`) renamed to the
//! spec's own three-state vocabulary so this registry-local health machine
//! stays textually distinct from a later retry-layer circuit breaker, even
//! though the state-transition shape (consecutive failures trip a check,
//! successes promote) is the same. The teacher's `DistributedCircuitBreaker`
//! (a cross-process, Persistence-backed breaker) is not reused here — the
//! spec only asks for in-process health tracking.

use std::collections::VecDeque;

use flowmesh_core::{HealthCheckResult, ProviderHealth, ProviderStats};

/// Rolling-window size for success-rate tracking. Spec §4.3 requires
/// `N ∈ [50, 500]`; 100 sits in the middle of that range.
pub const DEFAULT_WINDOW: usize = 100;

/// What happened to a provider's tracked health as a result of recording
/// an outcome, for logging at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    Promoted(ProviderHealth),
    Demoted(ProviderHealth),
}

/// Tracks one provider's rolling call outcomes, health state and
/// consecutive-failure counter (spec.md §4.3: "increment request/error
/// counts, maintain rolling success rate over the last N attempts... on
/// demand and on every 3rd consecutive failure, invoke health_check;
/// downgrade healthy -> degraded -> unhealthy accordingly; promote on a
/// successful call").
pub struct ProviderHealthTracker {
    health: ProviderHealth,
    window: VecDeque<bool>,
    window_size: usize,
    request_count: u64,
    error_count: u64,
    consecutive_failures: u32,
    in_flight: u32,
}

impl ProviderHealthTracker {
    pub fn new(window_size: usize) -> Self {
        Self {
            health: ProviderHealth::Healthy,
            window: VecDeque::with_capacity(window_size.clamp(50, 500)),
            window_size: window_size.clamp(50, 500),
            request_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            in_flight: 0,
        }
    }

    pub fn health(&self) -> ProviderHealth {
        self.health
    }

    pub fn begin_call(&mut self) {
        self.in_flight += 1;
    }

    /// Record the outcome of one completed call. Returns whether a health
    /// probe should now be run (every 3rd consecutive failure) and any
    /// state transition that already happened without a probe (promotion
    /// on success).
    pub fn record_outcome(&mut self, success: bool) -> (bool, HealthTransition) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.request_count += 1;
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(success);

        if success {
            self.consecutive_failures = 0;
            let transition = self.promote();
            (false, transition)
        } else {
            self.error_count += 1;
            self.consecutive_failures += 1;
            let should_probe = self.consecutive_failures % 3 == 0;
            (should_probe, HealthTransition::Unchanged)
        }
    }

    /// Apply the outcome of an explicit or triggered `health_check()`
    /// probe: the probe result becomes the provider's new tracked health
    /// directly, since it is an authoritative out-of-band signal distinct
    /// from ordinary call outcomes.
    pub fn apply_probe(&mut self, result: &HealthCheckResult) -> HealthTransition {
        if result.status == self.health {
            return HealthTransition::Unchanged;
        }
        let from_worse = matches!(
            (self.health, result.status),
            (ProviderHealth::Unhealthy, ProviderHealth::Healthy | ProviderHealth::Degraded)
                | (ProviderHealth::Degraded, ProviderHealth::Healthy)
        );
        self.health = result.status;
        if from_worse {
            HealthTransition::Promoted(self.health)
        } else {
            HealthTransition::Demoted(self.health)
        }
    }

    /// One-step promotion toward `Healthy` (unhealthy -> degraded ->
    /// healthy), used on an ordinary successful call rather than a probe.
    fn promote(&mut self) -> HealthTransition {
        let next = match self.health {
            ProviderHealth::Unhealthy => Some(ProviderHealth::Degraded),
            ProviderHealth::Degraded => Some(ProviderHealth::Healthy),
            ProviderHealth::Healthy => None,
        };
        match next {
            Some(h) => {
                self.health = h;
                HealthTransition::Promoted(h)
            }
            None => HealthTransition::Unchanged,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            1.0
        } else {
            let successes = self.window.iter().filter(|s| **s).count();
            successes as f64 / self.window.len() as f64
        }
    }

    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            request_count: self.request_count,
            error_count: self.error_count,
            success_rate: self.success_rate(),
            in_flight: self.in_flight,
        }
    }
}

impl Default for ProviderHealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_consecutive_failures_request_a_probe() {
        let mut tracker = ProviderHealthTracker::default();
        let (probe1, _) = tracker.record_outcome(false);
        let (probe2, _) = tracker.record_outcome(false);
        let (probe3, _) = tracker.record_outcome(false);
        assert!(!probe1);
        assert!(!probe2);
        assert!(probe3);
    }

    #[test]
    fn success_promotes_one_step() {
        let mut tracker = ProviderHealthTracker::default();
        tracker.apply_probe(&HealthCheckResult {
            status: ProviderHealth::Unhealthy,
            details: String::new(),
        });
        assert_eq!(tracker.health(), ProviderHealth::Unhealthy);
        tracker.record_outcome(true);
        assert_eq!(tracker.health(), ProviderHealth::Degraded);
        tracker.record_outcome(true);
        assert_eq!(tracker.health(), ProviderHealth::Healthy);
    }

    #[test]
    fn success_rate_reflects_window() {
        let mut tracker = ProviderHealthTracker::new(50);
        for _ in 0..3 {
            tracker.record_outcome(true);
        }
        tracker.record_outcome(false);
        assert_eq!(tracker.success_rate(), 0.75);
    }

    #[test]
    fn window_evicts_oldest_outcome() {
        let mut tracker = ProviderHealthTracker::new(50);
        for _ in 0..50 {
            tracker.record_outcome(false);
        }
        assert_eq!(tracker.success_rate(), 0.0);
        for _ in 0..50 {
            tracker.record_outcome(true);
        }
        assert_eq!(tracker.success_rate(), 1.0);
    }
}
