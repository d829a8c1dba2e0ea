//! Provider contract: the interface every provider, local or remote,
//! implements (spec.md §3 "Provider", §4.3, §6).
//!
//! Concrete providers (LLM clients, HTTP shims, Python function runners)
//! are deliberately out of scope (spec.md §1); this module defines only
//! the boundary the Registry (C3) dispatches across, grounded in the
//! teacher's type-erasure registry pattern
//! (`crates/durable/src/engine/registry.rs`) and the Python
//! `ProtocolProvider` base class (`original_source/providers/base.py`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;

/// Registry-local health classification, distinct from any per-call
/// circuit breaker (spec.md §3, SPEC_FULL.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of a `health_check()` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: ProviderHealth,
    #[serde(default)]
    pub details: String,
}

impl HealthCheckResult {
    pub fn healthy(details: impl Into<String>) -> Self {
        Self {
            status: ProviderHealth::Healthy,
            details: details.into(),
        }
    }

    pub fn unhealthy(details: impl Into<String>) -> Self {
        Self {
            status: ProviderHealth::Unhealthy,
            details: details.into(),
        }
    }
}

/// Rolling call statistics the Registry (C3) maintains per provider
/// (spec.md §3, §4.3: `request_count`, `error_count`, `success_rate` over
/// a window of `N ∈ [50, 500]` attempts).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderStats {
    pub request_count: u64,
    pub error_count: u64,
    pub success_rate: f64,
    pub in_flight: u32,
}

impl ProviderStats {
    pub fn new() -> Self {
        Self {
            request_count: 0,
            error_count: 0,
            success_rate: 1.0,
            in_flight: 0,
        }
    }
}

/// The contract every provider implements (spec.md §4.3/§6). Implemented
/// as an `async_trait` object so the Registry can hold `Arc<dyn Provider>`
/// without knowing the concrete provider type, mirroring the teacher's
/// `AnyWorkflow`/`WorkflowFactory` type-erasure shape.
#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_id(&self) -> &str;

    fn protocol_id(&self) -> &str;

    /// Called once before the provider accepts calls (connect to
    /// services, load config, etc).
    async fn initialize(&self) -> Result<(), TaskError>;

    /// Called once when the provider is being stopped.
    async fn shutdown(&self) -> Result<(), TaskError>;

    /// On-demand or periodic health probe.
    async fn health_check(&self) -> HealthCheckResult;

    /// Handle one already-validated JSON-RPC method call.
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, TaskError>;

    /// Methods this provider accepts; every name here must also exist on
    /// the protocol it claims (spec.md §3 invariant).
    fn get_supported_methods(&self) -> Vec<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn provider_id(&self) -> &str {
            "echo-1"
        }

        fn protocol_id(&self) -> &str {
            "echo/v1"
        }

        async fn initialize(&self) -> Result<(), TaskError> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), TaskError> {
            Ok(())
        }

        async fn health_check(&self) -> HealthCheckResult {
            HealthCheckResult::healthy("ok")
        }

        async fn handle_request(&self, _method: &str, params: Value) -> Result<Value, TaskError> {
            Ok(params)
        }

        fn get_supported_methods(&self) -> Vec<String> {
            vec!["echo".to_string()]
        }
    }

    #[tokio::test]
    async fn provider_trait_object_dispatches() {
        let provider: Box<dyn Provider> = Box::new(EchoProvider);
        let result = provider
            .handle_request("echo", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"x": 1}));
        assert_eq!(provider.get_supported_methods(), vec!["echo".to_string()]);
    }
}
