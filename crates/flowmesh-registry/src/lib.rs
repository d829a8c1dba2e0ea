//! Protocol/provider registry (C3): schema validation, provider selection
//! and health tracking (spec.md §4.3).
//!
//! Grounded in the teacher's type-erasure registry pattern
//! (`crates/durable/src/engine/registry.rs`: `AnyWorkflow`/`WorkflowFactory`)
//! repurposed to look up a `Provider` trait object by `(protocol_id,
//! method)` instead of a workflow type by type name, combined with the
//! Python `ProtocolProvider` base class (`original_source/providers/base.py`)
//! for the five-operation provider contract and its stat bookkeeping.

pub mod error;
pub mod health;
pub mod registry;

pub use error::RegistryError;
pub use health::{HealthTransition, ProviderHealthTracker};
pub use registry::ProtocolRegistry;
