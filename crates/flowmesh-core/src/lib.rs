//! # Flowmesh Core
//!
//! Domain model, error taxonomy and wire types shared by every other
//! `flowmesh-*` crate.
//!
//! ## Layout
//!
//! ```text
//! WorkflowDocument (YAML/JSON) --into_workflow()--> Workflow { Vec<Task> }
//!                                                        |
//!                                                        v
//!                                      flowmesh-engine drives dispatch,
//!                                      flowmesh-registry routes (protocol, method),
//!                                      flowmesh-persistence durably stores everything
//! ```
//!
//! This crate has no async runtime dependency beyond the `Provider` trait
//! definition (which every provider, local or remote, implements) — it is
//! safe to depend on from a provider implementation that does not otherwise
//! want the engine or persistence crates.

pub mod document;
pub mod error;
pub mod protocol;
pub mod provider;
pub mod result;
pub mod rpc;
pub mod task;
pub mod workflow;

pub mod prelude {
    pub use crate::document::{DocumentError, RetryDocument, TaskDocument, WorkflowDocument};
    pub use crate::error::{ErrorCategory, TaskError};
    pub use crate::protocol::{MethodSpec, ParameterSpec, ParameterType, ProtocolSpec, SchemaError};
    pub use crate::provider::{HealthCheckResult, Provider, ProviderHealth, ProviderStats};
    pub use crate::result::{ResultStatus, TaskResult};
    pub use crate::rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcErrorCode};
    pub use crate::task::{BackoffStrategy, Priority, RetryConfig, Task, TaskId, TaskStatus, WorkflowId};
    pub use crate::workflow::{ErrorStrategy, ExecutionStatus, Workflow, WorkflowStatus};
}

pub use prelude::*;
