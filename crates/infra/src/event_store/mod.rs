//! Append-only, tenant-scoped event store.
//!
//! `EventStore` is the storage boundary; `EventCursor` is the only way the
//! rest of the crate reads a stream back.

mod cursor;
mod in_memory;
mod postgres;
mod r#trait;

pub use cursor::{DEFAULT_PAGE_SIZE, EventCursor, events_after};
pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::EventStore;
