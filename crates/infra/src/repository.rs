//! Command execution pipeline for event-sourced aggregates.
//!
//! ```text
//! decide
//!   ↓
//! 1. Reconstruct current state (snapshot + later events, tenant-scoped)
//!   ↓
//! 2. Run the pure decision against that state, producing events
//!   ↓
//! 3. Append with ExpectedVersion::Exact(loaded version)
//!   ↓
//! 4. Snapshot when the configured interval is reached (best-effort)
//! ```
//!
//! A concurrent writer that committed between steps 1 and 3 makes the append
//! fail with `ConcurrencyConflict`. The repository never retries: the caller
//! decides whether to reload and decide again.

use std::sync::Arc;

use tracing::{instrument, warn};

use eventvault_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, SessionContext};
use eventvault_events::{DomainEvent, EventEnvelope, NewEvent};

use crate::error::StoreError;
use crate::event_store::EventStore;
use crate::reconstruct::AggregateReconstructor;
use crate::snapshot::SnapshotManager;

#[derive(Clone)]
pub struct AggregateRepository {
    reconstructor: AggregateReconstructor,
    snapshots: SnapshotManager,
    events: Arc<dyn EventStore>,
}

impl AggregateRepository {
    pub fn new(
        events: Arc<dyn EventStore>,
        reconstructor: AggregateReconstructor,
        snapshots: SnapshotManager,
    ) -> Self {
        Self {
            reconstructor,
            snapshots,
            events,
        }
    }

    /// Load, decide, append. Returns the committed events (empty when the
    /// decision produced none).
    #[instrument(
        skip(self, ctx, decide),
        fields(tenant_id = ?ctx.current_tenant(), aggregate_type = A::AGGREGATE_TYPE),
        err
    )]
    pub async fn execute<A, F>(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        decide: F,
    ) -> Result<Vec<EventEnvelope>, StoreError>
    where
        A: Aggregate,
        A::Event: DomainEvent,
        F: FnOnce(&A) -> Result<Vec<A::Event>, DomainError> + Send,
    {
        let loaded = self.reconstructor.load::<A>(ctx, aggregate_id).await?;
        let decided = decide(&loaded.state)?;
        if decided.is_empty() {
            return Ok(vec![]);
        }

        let new_events = decided
            .iter()
            .map(NewEvent::from_typed)
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self
            .events
            .append_batch(
                ctx,
                aggregate_id,
                new_events,
                ExpectedVersion::Exact(loaded.version),
            )
            .await?;

        if let Some(last) = committed.last() {
            if let Err(error) = self
                .snapshots
                .snapshot_if_due::<A>(ctx, aggregate_id, last.event_version)
                .await
            {
                warn!(aggregate_id = %aggregate_id, error = %error, "automatic snapshot failed");
            }
        }

        Ok(committed)
    }
}
