use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use eventvault_core::{AggregateId, SessionContext, TenantId};

use crate::error::StoreError;

/// Serialized aggregate state as of `snapshot_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    /// Version of the last event folded into `state`.
    pub snapshot_version: u64,
    pub state: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Persistence for snapshots, scoped to the session's tenant.
///
/// Snapshots are a cache over the event log: losing any of them only costs
/// replay time, never correctness.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store a snapshot. A snapshot already stored at the same version is
    /// replaced.
    async fn insert(&self, ctx: &SessionContext, snapshot: Snapshot) -> Result<(), StoreError>;

    /// Snapshot with the highest `snapshot_version`, if any.
    async fn latest(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, StoreError>;

    /// All stored snapshots, newest first.
    async fn list(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<Vec<Snapshot>, StoreError>;

    /// Delete all but the `keep` newest snapshots. Returns how many were removed.
    async fn prune(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        keep: usize,
    ) -> Result<usize, StoreError>;
}

#[async_trait]
impl<S> SnapshotStore for Arc<S>
where
    S: SnapshotStore + ?Sized,
{
    async fn insert(&self, ctx: &SessionContext, snapshot: Snapshot) -> Result<(), StoreError> {
        (**self).insert(ctx, snapshot).await
    }

    async fn latest(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, StoreError> {
        (**self).latest(ctx, aggregate_id).await
    }

    async fn list(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<Vec<Snapshot>, StoreError> {
        (**self).list(ctx, aggregate_id).await
    }

    async fn prune(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        keep: usize,
    ) -> Result<usize, StoreError> {
        (**self).prune(ctx, aggregate_id, keep).await
    }
}

/// Reject a snapshot stamped for a tenant other than the session's.
pub(crate) fn ensure_same_tenant(tenant_id: TenantId, snapshot: &Snapshot) -> Result<(), StoreError> {
    if snapshot.tenant_id != tenant_id {
        return Err(StoreError::TenantIsolation(format!(
            "snapshot of aggregate {} belongs to tenant {}, session is bound to {}",
            snapshot.aggregate_id, snapshot.tenant_id, tenant_id
        )));
    }
    Ok(())
}
