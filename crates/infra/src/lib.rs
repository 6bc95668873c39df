//! Infrastructure layer: event storage, snapshots, reconstruction and
//! projections, with in-memory and Postgres backends.

pub mod config;
pub mod error;
pub mod event_store;
pub mod pg;
pub mod projections;
pub mod reconstruct;
pub mod repository;
pub mod snapshot;
pub mod vault;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, ProjectionConfig, SnapshotPolicy, StoreConfig};
pub use error::StoreError;
pub use event_store::{EventCursor, EventStore, events_after};
pub use projections::{IncrementalOutcome, ProjectionEngine, ProjectionStatus, ProjectionView};
pub use reconstruct::{AggregateReconstructor, Reconstructed};
pub use repository::AggregateRepository;
pub use snapshot::{Snapshot, SnapshotManager, SnapshotStore};
pub use vault::EventVault;
