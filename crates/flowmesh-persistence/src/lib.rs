//! Durable storage (C1): the `Store` contract plus an in-memory and a
//! PostgreSQL implementation, generalized from the teacher's
//! `WorkflowEventStore` (`everruns-everruns/crates/durable/src/persistence`).

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{DeadLetterEntry, Store, StoreError, WorkerInfo};
