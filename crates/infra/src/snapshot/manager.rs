use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use eventvault_core::{Aggregate, AggregateId, SessionContext};

use super::store::{Snapshot, SnapshotStore};
use crate::config::SnapshotPolicy;
use crate::error::StoreError;
use crate::event_store::EventStore;
use crate::reconstruct::replay_from_scratch;

/// Creates snapshots and enforces the retention policy.
///
/// A snapshot is always folded from version 1 through a pinned cursor, so it
/// reflects exactly the events up to its `snapshot_version` regardless of
/// concurrent appends.
#[derive(Clone)]
pub struct SnapshotManager {
    events: Arc<dyn EventStore>,
    store: Arc<dyn SnapshotStore>,
    policy: SnapshotPolicy,
    page_size: usize,
}

impl SnapshotManager {
    pub fn new(
        events: Arc<dyn EventStore>,
        store: Arc<dyn SnapshotStore>,
        policy: SnapshotPolicy,
        page_size: usize,
    ) -> Self {
        Self {
            events,
            store,
            policy,
            page_size,
        }
    }

    pub fn policy(&self) -> SnapshotPolicy {
        self.policy
    }

    /// Fold the aggregate's events, store the result, prune old snapshots.
    ///
    /// Fails with `NotFound` when the aggregate has no events. Pruning is
    /// best-effort: a failure is logged and the new snapshot is still returned.
    #[instrument(
        skip(self, ctx),
        fields(tenant_id = ?ctx.current_tenant(), aggregate_type = A::AGGREGATE_TYPE),
        err
    )]
    pub async fn create_snapshot<A: Aggregate>(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<Snapshot, StoreError> {
        let tenant_id = ctx.require_tenant()?;
        let folded =
            replay_from_scratch::<A, _>(&*self.events, ctx, aggregate_id, self.page_size).await?;
        if folded.version == 0 {
            return Err(StoreError::NotFound(format!(
                "events for aggregate {aggregate_id}"
            )));
        }

        let snapshot = Snapshot {
            snapshot_id: Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            snapshot_version: folded.version,
            state: serde_json::to_value(&folded.state)?,
            created_at: Utc::now(),
        };
        self.store.insert(ctx, snapshot.clone()).await?;
        debug!(aggregate_id = %aggregate_id, version = snapshot.snapshot_version, "snapshot stored");

        match self.store.prune(ctx, aggregate_id, self.policy.retain()).await {
            Ok(0) => {}
            Ok(removed) => debug!(aggregate_id = %aggregate_id, removed, "pruned snapshots"),
            Err(error) => warn!(
                aggregate_id = %aggregate_id,
                error = %error,
                "snapshot pruning failed; older snapshots retained"
            ),
        }

        Ok(snapshot)
    }

    pub async fn latest_snapshot(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, StoreError> {
        self.store.latest(ctx, aggregate_id).await
    }

    /// Retained snapshots, newest first.
    pub async fn snapshots(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<Vec<Snapshot>, StoreError> {
        self.store.list(ctx, aggregate_id).await
    }

    /// Take a snapshot when `version` is at least `every` events past the
    /// latest one. A no-op without a configured interval.
    pub async fn snapshot_if_due<A: Aggregate>(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        version: u64,
    ) -> Result<Option<Snapshot>, StoreError> {
        let Some(every) = self.policy.every() else {
            return Ok(None);
        };
        let last = self
            .store
            .latest(ctx, aggregate_id)
            .await?
            .map_or(0, |s| s.snapshot_version);
        if version.saturating_sub(last) < every {
            return Ok(None);
        }
        self.create_snapshot::<A>(ctx, aggregate_id).await.map(Some)
    }
}
