//! Error category classification shared across every component.
//!
//! Retryability is a property of the category an error is constructed with,
//! never inferred from a message string (spec design note, §9 / §7).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Coarse error category. Every structured error in the system is
/// constructed with one of these so retry classification never has to
/// pattern-match on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed input: invalid params, unknown method, a cyclic DAG.
    Validation,
    /// Failed authentication or authorization.
    Authentication,
    /// No healthy provider was available to take the call.
    ProviderUnavailable,
    /// A deadline (schedule, execution or heartbeat) was exceeded.
    Timeout,
    /// Transient network/server failure (5xx, connection refused, rate limit).
    Transient,
    /// The persistence layer itself failed to commit a write.
    Persistence,
    /// An internal invariant was violated (uninitialized component, bug).
    System,
}

impl ErrorCategory {
    /// Whether a failure in this category should be retried, per the
    /// category table in spec §7.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::ProviderUnavailable | ErrorCategory::Timeout | ErrorCategory::Transient
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::ProviderUnavailable => "provider_unavailable",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Persistence => "persistence",
            ErrorCategory::System => "system",
        };
        write!(f, "{s}")
    }
}

/// A structured error carried through dispatch, retry scheduling and
/// terminal result recording.
///
/// `code` is a short machine-readable string (e.g. `INVALID_PARAMS`,
/// `PROVIDER_TIMEOUT`) matched against `spec.md` §7's examples; `message`
/// is human-readable; `data` carries any extra structured context a
/// provider returned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TaskError {
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, code, message)
    }

    pub fn authentication(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authentication, code, message)
    }

    pub fn provider_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ProviderUnavailable, code, message)
    }

    pub fn timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, code, message)
    }

    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, code, message)
    }

    pub fn persistence(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Persistence, code, message)
    }

    pub fn system(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::System, code, message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.category, self.message)
    }
}

impl std::error::Error for TaskError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_categories_match_spec_table() {
        assert!(ErrorCategory::ProviderUnavailable.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(!ErrorCategory::Validation.is_retryable());
        assert!(!ErrorCategory::Authentication.is_retryable());
        assert!(!ErrorCategory::Persistence.is_retryable());
        assert!(!ErrorCategory::System.is_retryable());
    }

    #[test]
    fn display_includes_code_and_category() {
        let err = TaskError::timeout("PROVIDER_TIMEOUT", "call exceeded 60s");
        let rendered = err.to_string();
        assert!(rendered.contains("PROVIDER_TIMEOUT"));
        assert!(rendered.contains("timeout"));
    }

    #[test]
    fn retryability_is_a_property_of_construction_not_message() {
        let err = TaskError::validation("INVALID_PARAMS", "retry me please, I promise");
        assert!(!err.is_retryable());
    }
}
