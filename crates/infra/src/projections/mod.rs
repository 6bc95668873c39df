//! Projections: materialized read models derived from the event log.
//!
//! Read models are disposable. The engine can always throw a record away and
//! rebuild it from the events, which remain the source of truth.

mod engine;
mod in_memory;
mod postgres;
mod store;

pub use engine::{IncrementalOutcome, ProjectionEngine, ProjectionView};
pub use in_memory::InMemoryProjectionStore;
pub use postgres::PostgresProjectionStore;
pub use store::{ProjectionKey, ProjectionRecord, ProjectionStatus, ProjectionStore};
