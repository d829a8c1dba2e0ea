//! Runs a two-step workflow (sum two numbers, then print a message that
//! references the sum) end to end against the in-memory `Store`, to show
//! the submit -> dispatch -> substitute -> reconcile path wired together.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flowmesh_core::{
    HealthCheckResult, MethodSpec, ParameterSpec, ParameterType, Provider, ProtocolSpec, TaskError, WorkflowDocument,
};
use flowmesh_engine::{EngineConfig, ExecutionEngine, RunMode, WorkflowManager};
use flowmesh_persistence::{InMemoryStore, Store};
use flowmesh_registry::ProtocolRegistry;
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct MathProvider;

#[async_trait]
impl Provider for MathProvider {
    fn provider_id(&self) -> &str {
        "math-local"
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
        HealthCheckResult::healthy("ready")
    }
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, TaskError> {
        match method {
            "add" => {
                let a = params["a"].as_f64().unwrap_or(0.0);
                let b = params["b"].as_f64().unwrap_or(0.0);
                Ok(json!({"sum": a + b}))
            }
            other => Err(TaskError::validation("METHOD_NOT_FOUND", format!("unknown method {other}"))),
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

struct PrintProvider;

#[async_trait]
impl Provider for PrintProvider {
    fn provider_id(&self) -> &str {
        "print-local"
    }
    fn protocol_id(&self) -> &str {
        "print/v1"
    }
    async fn initialize(&self) -> Result<(), TaskError> {
        Ok(())
    }
    async fn shutdown(&self) -> Result<(), TaskError> {
        Ok(())
    }
    async fn health_check(&self) -> HealthCheckResult {
        HealthCheckResult::healthy("ready")
    }
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, TaskError> {
        match method {
            "echo" => {
                let text = params["text"].as_str().unwrap_or_default().to_string();
                println!("[print/v1::echo] {text}");
                Ok(json!({"printed": text}))
            }
            other => Err(TaskError::validation("METHOD_NOT_FOUND", format!("unknown method {other}"))),
        }
    }
    fn get_supported_methods(&self) -> Vec<String> {
        vec!["echo".to_string()]
    }
}

fn print_protocol() -> ProtocolSpec {
    ProtocolSpec::new("print/v1")
        .with_method(MethodSpec::new("echo").with_param(ParameterSpec::new("text", ParameterType::String).required()))
}

const WORKFLOW_YAML: &str = r#"
name: calc-then-print
description: sum two numbers, then print a sentence referencing the sum
tasks:
  - name: sum
    protocol: math/v1
    method: add
    params: {a: 2, b: 40}
  - name: report
    protocol: print/v1
    method: echo
    dependencies: [sum]
    params: {text: "the sum is ${sum.sum}"}
"#;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "flowmesh=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let registry = Arc::new(ProtocolRegistry::new());
    registry.register_protocol(math_protocol())?;
    registry.register_protocol(print_protocol())?;
    registry.register_provider(Arc::new(MathProvider)).await?;
    registry.register_provider(Arc::new(PrintProvider)).await?;

    let engine = ExecutionEngine::new(store.clone(), registry, EngineConfig::default());
    let manager = WorkflowManager::new(store.clone(), engine.clone());

    let workflow = WorkflowDocument::from_yaml(WORKFLOW_YAML)
        .context("parsing workflow document")?
        .into_workflow()
        .context("expanding workflow document")?;
    let workflow_id = manager.submit_workflow(workflow).await.context("submitting workflow")?;
    tracing::info!(workflow_id = %workflow_id, "workflow submitted");

    engine.run(RunMode::WorkflowOnly).await.context("running workflow to completion")?;

    let status = manager.get_execution_status(&workflow_id).await.context("fetching execution status")?;
    println!("workflow {workflow_id} finished: {status:?}");

    Ok(())
}
