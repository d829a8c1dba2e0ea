//! `ProtocolRegistry`: protocol/provider registration, call validation and
//! provider selection (spec.md §4.3).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use flowmesh_core::{HealthCheckResult, ProtocolSpec, Provider, ProviderHealth, ProviderStats, TaskError};

use crate::error::RegistryError;
use crate::health::{ProviderHealthTracker, DEFAULT_WINDOW};

struct ProviderEntry {
    provider: Arc<dyn Provider>,
    health: Mutex<ProviderHealthTracker>,
}

/// Routes `(protocol, method)` calls to a healthy provider, validates
/// outbound params against the protocol's declared schema, and tracks
/// provider health. Read-mostly provider map behind `dashmap`, matching
/// the teacher's registry/resolver concurrency choices (SPEC_FULL.md §5).
pub struct ProtocolRegistry {
    protocols: DashMap<String, ProtocolSpec>,
    providers: DashMap<String, ProviderEntry>,
    window_size: usize,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self {
            protocols: DashMap::new(),
            providers: DashMap::new(),
            window_size: DEFAULT_WINDOW,
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size.clamp(50, 500);
        self
    }

    /// Register a protocol spec. Rejects a conflicting re-registration
    /// (same id, different methods); an identical re-registration is a
    /// no-op (spec.md §4.3: "reject duplicates except for exact
    /// re-registration").
    #[instrument(skip(self, spec), fields(protocol_id = %spec.protocol_id))]
    pub fn register_protocol(&self, spec: ProtocolSpec) -> Result<(), RegistryError> {
        if !ProtocolSpec::is_well_formed_id(&spec.protocol_id) {
            return Err(RegistryError::MalformedProtocolId(spec.protocol_id));
        }
        if let Some(existing) = self.protocols.get(&spec.protocol_id) {
            if *existing == spec {
                return Ok(());
            }
            return Err(RegistryError::ProtocolConflict(spec.protocol_id));
        }
        info!("registering protocol");
        self.protocols.insert(spec.protocol_id.clone(), spec);
        Ok(())
    }

    pub fn protocol(&self, protocol_id: &str) -> Option<ProtocolSpec> {
        self.protocols.get(protocol_id).map(|e| e.clone())
    }

    /// Register a provider. Rejects registration if its declared protocol
    /// is unknown or any advertised method is absent from the protocol
    /// spec (spec.md §3/§4.3 invariant). Calls the provider's
    /// `initialize()` as part of registration (the Registry owns provider
    /// lifecycle, spec.md §3 Ownership).
    #[instrument(skip(self, provider), fields(provider_id = %provider.provider_id()))]
    pub async fn register_provider(&self, provider: Arc<dyn Provider>) -> Result<(), RegistryError> {
        let provider_id = provider.provider_id().to_string();
        let protocol_id = provider.protocol_id().to_string();

        let spec = self
            .protocols
            .get(&protocol_id)
            .ok_or_else(|| RegistryError::ProviderProtocolUnknown {
                provider_id: provider_id.clone(),
                protocol_id: protocol_id.clone(),
            })?
            .clone();

        for method in provider.get_supported_methods() {
            if spec.method(&method).is_none() {
                return Err(RegistryError::MethodNotAdvertised {
                    provider_id,
                    protocol_id,
                    method,
                });
            }
        }

        provider
            .initialize()
            .await
            .map_err(|e| RegistryError::InitializationFailed(provider_id.clone(), e.to_string()))?;

        info!(protocol_id = %protocol_id, "registered provider");
        self.providers.insert(
            provider_id,
            ProviderEntry {
                provider,
                health: Mutex::new(ProviderHealthTracker::new(self.window_size)),
            },
        );
        Ok(())
    }

    /// Gracefully shut down and remove a provider.
    pub async fn deregister_provider(&self, provider_id: &str) -> Result<(), RegistryError> {
        let (_, entry) = self
            .providers
            .remove(provider_id)
            .ok_or_else(|| RegistryError::ProviderNotFound(provider_id.to_string()))?;
        let _ = entry.provider.shutdown().await;
        Ok(())
    }

    /// Validate `params` against `(protocol, method)`'s declared schema,
    /// applying defaults (spec.md §4.3: "reject with `INVALID_PARAMS` if
    /// validation fails").
    pub fn validate_call(&self, protocol_id: &str, method: &str, params: &Value) -> Result<Value, RegistryError> {
        let spec = self
            .protocols
            .get(protocol_id)
            .ok_or_else(|| RegistryError::UnknownProtocol(protocol_id.to_string()))?;
        let method_spec = spec.method(method).ok_or_else(|| RegistryError::MethodNotFound {
            protocol_id: protocol_id.to_string(),
            method: method.to_string(),
        })?;
        Ok(method_spec.validate_params(params)?)
    }

    /// Select a healthy provider for `(protocol, method)`: among providers
    /// with `status = healthy`, prefer highest `success_rate`, tie-broken
    /// by lowest in-flight load (spec.md §4.3).
    pub fn select_provider(&self, protocol_id: &str, method: &str) -> Result<Arc<dyn Provider>, RegistryError> {
        let mut best: Option<(Arc<dyn Provider>, f64, u32)> = None;
        for entry in self.providers.iter() {
            if entry.provider.protocol_id() != protocol_id {
                continue;
            }
            if !entry.provider.get_supported_methods().iter().any(|m| m == method) {
                continue;
            }
            let health = entry.health.lock();
            if health.health() != ProviderHealth::Healthy {
                continue;
            }
            let stats = health.stats();
            let candidate = (entry.provider.clone(), stats.success_rate, stats.in_flight);
            best = match best {
                None => Some(candidate),
                Some((_, best_rate, best_load))
                    if candidate.1 > best_rate || (candidate.1 == best_rate && candidate.2 < best_load) =>
                {
                    Some(candidate)
                }
                some => some,
            };
        }
        best.map(|(p, _, _)| p).ok_or_else(|| RegistryError::ProviderUnavailable {
            protocol_id: protocol_id.to_string(),
            method: method.to_string(),
        })
    }

    /// Validate params, select a healthy provider and execute the call,
    /// updating rolling stats and health state (spec.md §4.3 "Execute").
    /// Does not apply a timeout; the Execution Engine wraps this call
    /// with the task's deadline (spec.md §4.7 step 5).
    #[instrument(skip(self, params), fields(protocol_id = %protocol_id, method = %method))]
    pub async fn execute(&self, protocol_id: &str, method: &str, params: Value) -> Result<Value, TaskError> {
        let validated = self
            .validate_call(protocol_id, method, &params)
            .map_err(RegistryError::into_task_error)?;
        let provider = self
            .select_provider(protocol_id, method)
            .map_err(RegistryError::into_task_error)?;
        let provider_id = provider.provider_id().to_string();

        if let Some(entry) = self.providers.get(&provider_id) {
            entry.health.lock().begin_call();
        }

        let outcome = provider.handle_request(method, validated).await;

        let should_probe = if let Some(entry) = self.providers.get(&provider_id) {
            let mut health = entry.health.lock();
            let (should_probe, _transition) = health.record_outcome(outcome.is_ok());
            should_probe
        } else {
            false
        };

        if should_probe {
            self.probe(&provider_id).await;
        }

        outcome
    }

    /// On-demand (or every-3rd-consecutive-failure-triggered) health
    /// probe; the probe result becomes the provider's new tracked health
    /// directly (spec.md §4.3).
    #[instrument(skip(self))]
    pub async fn probe(&self, provider_id: &str) -> Option<HealthCheckResult> {
        let provider = self.providers.get(provider_id)?.provider.clone();
        let result = provider.health_check().await;
        if let Some(entry) = self.providers.get(provider_id) {
            let transition = entry.health.lock().apply_probe(&result);
            debug!(?transition, status = ?result.status, "health probe applied");
            if result.status != ProviderHealth::Healthy {
                warn!(provider_id, status = ?result.status, "provider unhealthy after probe");
            }
        }
        Some(result)
    }

    pub fn provider_stats(&self, provider_id: &str) -> Option<ProviderStats> {
        self.providers.get(provider_id).map(|e| e.health.lock().stats())
    }

    pub fn provider_health(&self, provider_id: &str) -> Option<ProviderHealth> {
        self.providers.get(provider_id).map(|e| e.health.lock().health())
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowmesh_core::{MethodSpec, ParameterSpec, ParameterType};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FlakyProvider {
        id: String,
        protocol: String,
        fail_next: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        fn provider_id(&self) -> &str {
            &self.id
        }
        fn protocol_id(&self) -> &str {
            &self.protocol
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                Err(TaskError::transient("PROVIDER_TIMEOUT", "simulated failure"))
            } else {
                Ok(params)
            }
        }
        fn get_supported_methods(&self) -> Vec<String> {
            vec!["add".to_string()]
        }
    }

    fn math_protocol() -> ProtocolSpec {
        ProtocolSpec::new("math/v1").with_method(
            MethodSpec::new("add")
                .with_param(ParameterSpec::new("a", ParameterType::Number).required())
                .with_param(ParameterSpec::new("b", ParameterType::Number).required()),
        )
    }

    #[tokio::test]
    async fn registers_protocol_and_provider_then_executes() {
        let registry = ProtocolRegistry::new();
        registry.register_protocol(math_protocol()).unwrap();
        let provider = Arc::new(FlakyProvider {
            id: "math-1".into(),
            protocol: "math/v1".into(),
            fail_next: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        });
        registry.register_provider(provider).await.unwrap();

        let result = registry.execute("math/v1", "add", json!({"a": 1, "b": 2})).await.unwrap();
        assert_eq!(result, json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn rejects_provider_for_unknown_protocol() {
        let registry = ProtocolRegistry::new();
        let provider = Arc::new(FlakyProvider {
            id: "math-1".into(),
            protocol: "math/v1".into(),
            fail_next: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        });
        let err = registry.register_provider(provider).await.unwrap_err();
        assert!(matches!(err, RegistryError::ProviderProtocolUnknown { .. }));
    }

    #[tokio::test]
    async fn invalid_params_rejected_before_dispatch() {
        let registry = ProtocolRegistry::new();
        registry.register_protocol(math_protocol()).unwrap();
        let provider = Arc::new(FlakyProvider {
            id: "math-1".into(),
            protocol: "math/v1".into(),
            fail_next: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        });
        registry.register_provider(provider.clone()).await.unwrap();

        let err = registry.execute("math/v1", "add", json!({"a": 1})).await.unwrap_err();
        assert_eq!(err.code, "INVALID_PARAMS");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_healthy_provider_returns_unavailable() {
        let registry = ProtocolRegistry::new();
        registry.register_protocol(math_protocol()).unwrap();
        let err = registry.execute("math/v1", "add", json!({"a": 1, "b": 2})).await.unwrap_err();
        assert_eq!(err.code, "PROVIDER_NOT_AVAILABLE");
    }

    #[tokio::test]
    async fn three_consecutive_failures_trigger_a_probe_that_can_demote() {
        struct AlwaysFailThenUnhealthy {
            id: String,
        }
        #[async_trait]
        impl Provider for AlwaysFailThenUnhealthy {
            fn provider_id(&self) -> &str {
                &self.id
            }
            fn protocol_id(&self) -> &str {
                "math/v1"
            }
            async fn initialize(&self) -> Result<(), TaskError> {
                Ok(())
            }
            async fn shutdown(&self) -> Result<(), TaskError> {
                Ok(())
            }
            async fn health_check(&self) -> HealthCheckResult {
                HealthCheckResult::unhealthy("still down")
            }
            async fn handle_request(&self, _method: &str, _params: Value) -> Result<Value, TaskError> {
                Err(TaskError::transient("PROVIDER_TIMEOUT", "down"))
            }
            fn get_supported_methods(&self) -> Vec<String> {
                vec!["add".to_string()]
            }
        }

        let registry = ProtocolRegistry::new();
        registry.register_protocol(math_protocol()).unwrap();
        let provider = Arc::new(AlwaysFailThenUnhealthy { id: "math-1".into() });
        registry.register_provider(provider).await.unwrap();

        for _ in 0..3 {
            let _ = registry.execute("math/v1", "add", json!({"a": 1, "b": 2})).await;
        }

        assert_eq!(registry.provider_health("math-1"), Some(ProviderHealth::Unhealthy));
    }
}
