use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use eventvault_core::{AggregateId, SessionContext, TenantId};

use super::store::{Snapshot, SnapshotStore, ensure_same_tenant};
use crate::error::StoreError;

type Versions = BTreeMap<u64, Snapshot>;

/// In-memory snapshot store (tests/dev).
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    inner: RwLock<HashMap<(TenantId, AggregateId), Versions>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn insert(&self, ctx: &SessionContext, snapshot: Snapshot) -> Result<(), StoreError> {
        let tenant_id = ctx.require_tenant()?;
        ensure_same_tenant(tenant_id, &snapshot)?;

        let mut inner = self.inner.write().map_err(|_| StoreError::poisoned("snapshots"))?;
        inner
            .entry((tenant_id, snapshot.aggregate_id))
            .or_default()
            .insert(snapshot.snapshot_version, snapshot);
        Ok(())
    }

    async fn latest(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, StoreError> {
        let tenant_id = ctx.require_tenant()?;
        let inner = self.inner.read().map_err(|_| StoreError::poisoned("snapshots"))?;
        Ok(inner
            .get(&(tenant_id, aggregate_id))
            .and_then(|versions| versions.values().next_back())
            .cloned())
    }

    async fn list(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let tenant_id = ctx.require_tenant()?;
        let inner = self.inner.read().map_err(|_| StoreError::poisoned("snapshots"))?;
        Ok(inner
            .get(&(tenant_id, aggregate_id))
            .map(|versions| versions.values().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn prune(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        keep: usize,
    ) -> Result<usize, StoreError> {
        let tenant_id = ctx.require_tenant()?;
        let mut inner = self.inner.write().map_err(|_| StoreError::poisoned("snapshots"))?;
        let Some(versions) = inner.get_mut(&(tenant_id, aggregate_id)) else {
            return Ok(0);
        };

        let excess = versions.len().saturating_sub(keep);
        let doomed: Vec<u64> = versions.keys().take(excess).copied().collect();
        for version in &doomed {
            versions.remove(version);
        }
        Ok(doomed.len())
    }
}
