//! Wiring: one handle over the event store, snapshots, reconstruction,
//! projections and the command repository, all sharing the same backends.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::StoreConfig;
use crate::event_store::{EventStore, InMemoryEventStore, PostgresEventStore};
use crate::projections::{
    InMemoryProjectionStore, PostgresProjectionStore, ProjectionEngine, ProjectionStore,
};
use crate::reconstruct::AggregateReconstructor;
use crate::repository::AggregateRepository;
use crate::snapshot::{InMemorySnapshotStore, PostgresSnapshotStore, SnapshotManager, SnapshotStore};

#[derive(Clone)]
pub struct EventVault {
    events: Arc<dyn EventStore>,
    snapshots: SnapshotManager,
    reconstructor: AggregateReconstructor,
    projections: Arc<ProjectionEngine>,
    repository: AggregateRepository,
    config: StoreConfig,
}

impl EventVault {
    /// Assemble a vault from explicit backends.
    pub fn new(
        events: Arc<dyn EventStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        projection_store: Arc<dyn ProjectionStore>,
        config: StoreConfig,
    ) -> Self {
        let page_size = config.page_size();
        let snapshots = SnapshotManager::new(
            events.clone(),
            snapshot_store.clone(),
            config.snapshots,
            page_size,
        );
        let reconstructor = AggregateReconstructor::new(events.clone(), snapshot_store, page_size);
        let projections = Arc::new(ProjectionEngine::new(
            events.clone(),
            projection_store,
            config.projections,
            page_size,
        ));
        let repository =
            AggregateRepository::new(events.clone(), reconstructor.clone(), snapshots.clone());

        Self {
            events,
            snapshots,
            reconstructor,
            projections,
            repository,
            config,
        }
    }

    /// Process-local backends (tests/dev).
    pub fn in_memory(config: StoreConfig) -> Self {
        Self::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(InMemoryProjectionStore::new()),
            config,
        )
    }

    /// Postgres backends sharing one pool. The schema must already exist
    /// (see `pg::migrate`).
    pub fn postgres(pool: PgPool, config: StoreConfig) -> Self {
        Self::new(
            Arc::new(PostgresEventStore::new(pool.clone())),
            Arc::new(PostgresSnapshotStore::new(pool.clone())),
            Arc::new(PostgresProjectionStore::new(pool)),
            config,
        )
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn reconstructor(&self) -> &AggregateReconstructor {
        &self.reconstructor
    }

    pub fn projections(&self) -> &ProjectionEngine {
        &self.projections
    }

    pub fn repository(&self) -> &AggregateRepository {
        &self.repository
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}
