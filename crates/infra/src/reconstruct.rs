//! Aggregate reconstruction: latest snapshot plus the events after it.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, instrument};

use eventvault_core::{Aggregate, AggregateId, SessionContext};

use crate::error::StoreError;
use crate::event_store::{EventCursor, EventStore};
use crate::snapshot::{Snapshot, SnapshotStore};

/// Aggregate state together with the version of the last event folded into it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstructed<A> {
    pub state: A,
    /// `0` for an aggregate with no events.
    pub version: u64,
}

/// Rebuilds aggregate state on demand. Read-only: never writes snapshots.
///
/// The result never depends on which snapshots happen to exist; a snapshot
/// only changes where the fold starts.
#[derive(Clone)]
pub struct AggregateReconstructor {
    events: Arc<dyn EventStore>,
    snapshots: Arc<dyn SnapshotStore>,
    page_size: usize,
}

impl AggregateReconstructor {
    pub fn new(
        events: Arc<dyn EventStore>,
        snapshots: Arc<dyn SnapshotStore>,
        page_size: usize,
    ) -> Self {
        Self {
            events,
            snapshots,
            page_size,
        }
    }

    /// Current state: newest snapshot (if any), then every later event.
    #[instrument(skip(self, ctx), fields(tenant_id = ?ctx.current_tenant(), aggregate_type = A::AGGREGATE_TYPE), err)]
    pub async fn load<A: Aggregate>(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<Reconstructed<A>, StoreError> {
        let (mut state, since) = match self.snapshots.latest(ctx, aggregate_id).await? {
            Some(snapshot) => (decode_snapshot::<A>(&snapshot)?, snapshot.snapshot_version),
            None => (A::default(), 0),
        };
        debug!(aggregate_id = %aggregate_id, since, "reconstructing aggregate");

        let mut cursor =
            EventCursor::open(&*self.events, ctx, aggregate_id, since, self.page_size).await?;
        let version = fold(&mut cursor, &mut state).await?;
        Ok(Reconstructed { state, version })
    }

    /// Full replay from version 1, ignoring snapshots.
    pub async fn load_from_scratch<A: Aggregate>(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<Reconstructed<A>, StoreError> {
        replay_from_scratch(&*self.events, ctx, aggregate_id, self.page_size).await
    }
}

pub(crate) async fn replay_from_scratch<A, S>(
    events: &S,
    ctx: &SessionContext,
    aggregate_id: AggregateId,
    page_size: usize,
) -> Result<Reconstructed<A>, StoreError>
where
    A: Aggregate,
    S: EventStore + ?Sized,
{
    let mut state = A::default();
    let mut cursor = EventCursor::open(events, ctx, aggregate_id, 0, page_size).await?;
    let version = fold(&mut cursor, &mut state).await?;
    Ok(Reconstructed { state, version })
}

/// Apply every remaining event of `cursor` to `state`; returns the version reached.
async fn fold<A, S>(cursor: &mut EventCursor<'_, S>, state: &mut A) -> Result<u64, StoreError>
where
    A: Aggregate,
    S: EventStore + ?Sized,
{
    while let Some(envelope) = cursor.next().await? {
        let event: A::Event = envelope.decode().map_err(|e| {
            StoreError::Serialization(format!(
                "{} event {} (v{}) of aggregate {}: {e}",
                A::AGGREGATE_TYPE,
                envelope.event_type,
                envelope.event_version,
                envelope.aggregate_id
            ))
        })?;
        state.apply(&event);
    }
    Ok(cursor.position())
}

fn decode_snapshot<A: Aggregate>(snapshot: &Snapshot) -> Result<A, StoreError> {
    A::deserialize(&snapshot.state).map_err(|e| {
        StoreError::Serialization(format!(
            "{} snapshot v{} of aggregate {}: {e}",
            A::AGGREGATE_TYPE,
            snapshot.snapshot_version,
            snapshot.aggregate_id
        ))
    })
}
