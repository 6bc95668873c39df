//! Aggregate snapshots: folded state checkpoints with bounded retention.

mod in_memory;
mod manager;
mod postgres;
mod store;

pub use in_memory::InMemorySnapshotStore;
pub use manager::SnapshotManager;
pub use postgres::PostgresSnapshotStore;
pub use store::{Snapshot, SnapshotStore};
