use std::sync::Arc;

use async_trait::async_trait;

use eventvault_core::{AggregateId, ExpectedVersion, SessionContext};
use eventvault_events::{EventEnvelope, NewEvent};

use crate::error::StoreError;

/// Append-only, tenant-scoped event store.
///
/// The `EventStore` is the source of truth. Events are organized into one
/// stream per aggregate, keyed by `(tenant_id, aggregate_id)`, with gapless
/// versions starting at 1.
///
/// ## Session context
///
/// Every method takes the caller's `SessionContext` and resolves the tenant
/// from it first. Without a bound tenant the call fails with
/// `StoreError::MissingTenantContext`; there is no tenant-wide fallback.
///
/// ## Append semantics
///
/// `append_batch()`:
/// - checks the optimistic concurrency expectation against the stream's
///   current version
/// - assigns versions starting at `current_version + 1`
/// - persists the whole batch or nothing
///
/// The check and the insert must be one atomic step: two writers that both
/// read version N can never both commit N+1.
///
/// ## Read semantics
///
/// `read_range()` is the ordered range read that `EventCursor` pages through.
/// An aggregate with no events is valid and simply reads as empty at
/// version 0.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events to one aggregate stream atomically.
    async fn append_batch(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<EventEnvelope>, StoreError>;

    /// Append a single event (`event_version = current_version + 1`).
    async fn append(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        event: NewEvent,
        expected_version: ExpectedVersion,
    ) -> Result<EventEnvelope, StoreError> {
        let mut committed = self
            .append_batch(ctx, aggregate_id, vec![event], expected_version)
            .await?;
        committed
            .pop()
            .ok_or_else(|| StoreError::Integrity("append committed no event".to_string()))
    }

    /// Highest stored version for the aggregate, or 0 if it has no events.
    async fn current_version(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<u64, StoreError>;

    /// Events with `after < event_version <= up_to`, ascending, at most `limit`.
    async fn read_range(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        after: u64,
        up_to: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, StoreError>;

    /// Every aggregate of the session's tenant that has at least one event,
    /// ascending by id.
    async fn aggregate_ids(&self, ctx: &SessionContext) -> Result<Vec<AggregateId>, StoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append_batch(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        (**self)
            .append_batch(ctx, aggregate_id, events, expected_version)
            .await
    }

    async fn current_version(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<u64, StoreError> {
        (**self).current_version(ctx, aggregate_id).await
    }

    async fn read_range(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        after: u64,
        up_to: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        (**self)
            .read_range(ctx, aggregate_id, after, up_to, limit)
            .await
    }

    async fn aggregate_ids(&self, ctx: &SessionContext) -> Result<Vec<AggregateId>, StoreError> {
        (**self).aggregate_ids(ctx).await
    }
}
