//! Registry error taxonomy (spec.md §4.3/§7).

use flowmesh_core::{ErrorCategory, SchemaError, TaskError};
use thiserror::Error;

/// Errors raised registering protocols/providers or routing a call.
/// Every variant answers `.is_retryable()` without inspecting text, per
/// the spec's "retryability is a property of the category" design note.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("protocol id '{0}' is not of the form name/vN")]
    MalformedProtocolId(String),

    #[error("protocol '{0}' is already registered with a different spec")]
    ProtocolConflict(String),

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("provider '{provider_id}' claims unknown protocol '{protocol_id}'")]
    ProviderProtocolUnknown { provider_id: String, protocol_id: String },

    #[error("provider '{provider_id}' advertises method '{method}' not defined on protocol '{protocol_id}'")]
    MethodNotAdvertised {
        provider_id: String,
        protocol_id: String,
        method: String,
    },

    #[error("method '{method}' not found on protocol '{protocol_id}'")]
    MethodNotFound { protocol_id: String, method: String },

    #[error("invalid params: {0}")]
    InvalidParams(#[from] SchemaError),

    #[error("no healthy provider available for {protocol_id}.{method}")]
    ProviderUnavailable { protocol_id: String, method: String },

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("provider '{0}' failed to initialize: {1}")]
    InitializationFailed(String, String),
}

impl RegistryError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RegistryError::MalformedProtocolId(_)
            | RegistryError::ProtocolConflict(_)
            | RegistryError::UnknownProtocol(_)
            | RegistryError::ProviderProtocolUnknown { .. }
            | RegistryError::MethodNotAdvertised { .. }
            | RegistryError::MethodNotFound { .. }
            | RegistryError::InvalidParams(_) => ErrorCategory::Validation,
            RegistryError::ProviderUnavailable { .. } | RegistryError::ProviderNotFound(_) => {
                ErrorCategory::ProviderUnavailable
            }
            RegistryError::InitializationFailed(_, _) => ErrorCategory::System,
        }
    }

    /// Short machine-readable code, matching spec §4.3/§7's vocabulary.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::MalformedProtocolId(_) => "INVALID_PROTOCOL_ID",
            RegistryError::ProtocolConflict(_) => "PROTOCOL_CONFLICT",
            RegistryError::UnknownProtocol(_) => "UNKNOWN_PROTOCOL",
            RegistryError::ProviderProtocolUnknown { .. } => "UNKNOWN_PROTOCOL",
            RegistryError::MethodNotAdvertised { .. } => "METHOD_NOT_FOUND",
            RegistryError::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            RegistryError::InvalidParams(_) => "INVALID_PARAMS",
            RegistryError::ProviderUnavailable { .. } => "PROVIDER_NOT_AVAILABLE",
            RegistryError::ProviderNotFound(_) => "PROVIDER_NOT_AVAILABLE",
            RegistryError::InitializationFailed(_, _) => "PROVIDER_INITIALIZATION_FAILED",
        }
    }

    pub fn into_task_error(self) -> TaskError {
        let category = self.category();
        let code = self.code();
        TaskError::new(category, code, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = RegistryError::UnknownProtocol("math/v1".into());
        assert!(!err.category().is_retryable());
    }

    #[test]
    fn provider_unavailable_is_retryable() {
        let err = RegistryError::ProviderUnavailable {
            protocol_id: "math/v1".into(),
            method: "add".into(),
        };
        assert!(err.category().is_retryable());
    }
}
