//! Backpressure (C7 supplement, SPEC_FULL.md §4.7 ambient concern).
//!
//! Grounded directly on the teacher's `worker/backpressure.rs`: the same
//! high/low watermark hysteresis over current load relative to
//! `max_concurrency`, adapted from the teacher's claimed-activity-count
//! load signal to this engine's in-flight dispatch count.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackpressureError {
    #[error("invalid backpressure config: {0}")]
    InvalidConfig(String),
}

/// Hysteresis thresholds as a fraction of `max_concurrency`. Stops
/// accepting new dispatches at `high_watermark`, resumes at
/// `low_watermark` once load has drained back down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureConfig {
    pub high_watermark: f64,
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self { high_watermark: 0.9, low_watermark: 0.7 }
    }
}

impl BackpressureConfig {
    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.low_watermark >= self.high_watermark {
            return Err(BackpressureError::InvalidConfig(format!(
                "low_watermark ({}) must be < high_watermark ({})",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }
}

/// Tracks current dispatch load against `max_concurrency` and applies
/// watermark hysteresis so the engine doesn't thrash between
/// accepting/rejecting on every single slot change.
pub struct BackpressureState {
    config: BackpressureConfig,
    max_concurrency: usize,
    current_load: AtomicUsize,
    accepting: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl BackpressureState {
    pub fn new(config: BackpressureConfig, max_concurrency: usize) -> Self {
        Self {
            config,
            max_concurrency,
            current_load: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            reason: RwLock::new(None),
        }
    }

    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrency == 0 {
            return 1.0;
        }
        self.current_load.load(Ordering::Relaxed) as f64 / self.max_concurrency as f64
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Update state after every load change: stop accepting once the
    /// ratio crosses `high_watermark`, resume once it drops back below
    /// `low_watermark`.
    fn recompute(&self) {
        let ratio = self.load_ratio();
        if self.accepting.load(Ordering::Relaxed) && ratio >= self.config.high_watermark {
            self.accepting.store(false, Ordering::Relaxed);
            *self.reason.write() = Some(format!("load ratio {ratio:.2} reached high watermark"));
        } else if !self.accepting.load(Ordering::Relaxed) && ratio <= self.config.low_watermark {
            self.accepting.store(true, Ordering::Relaxed);
            *self.reason.write() = None;
        }
    }

    pub fn task_started(&self) {
        self.current_load.fetch_add(1, Ordering::Relaxed);
        self.recompute();
    }

    pub fn task_completed(&self) {
        self.current_load.fetch_sub(1, Ordering::Relaxed);
        self.recompute();
    }

    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::Relaxed)
    }

    pub fn available_slots(&self) -> usize {
        self.max_concurrency.saturating_sub(self.current_load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_config_with_inverted_watermarks() {
        let cfg = BackpressureConfig { high_watermark: 0.5, low_watermark: 0.9 };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stops_accepting_at_high_watermark_and_resumes_at_low() {
        let state = BackpressureState::new(
            BackpressureConfig { high_watermark: 0.8, low_watermark: 0.5 },
            10,
        );
        for _ in 0..8 {
            state.task_started();
        }
        assert!(!state.is_accepting());
        for _ in 0..3 {
            state.task_completed();
        }
        assert!(state.is_accepting());
    }

    #[test]
    fn hysteresis_keeps_rejecting_between_watermarks() {
        let state = BackpressureState::new(
            BackpressureConfig { high_watermark: 0.8, low_watermark: 0.5 },
            10,
        );
        for _ in 0..8 {
            state.task_started();
        }
        assert!(!state.is_accepting());
        state.task_completed();
        assert!(!state.is_accepting(), "load ratio 0.7 is still above low_watermark");
    }
}
