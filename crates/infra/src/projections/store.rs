use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use eventvault_core::{AggregateId, SessionContext, TenantId};
use eventvault_events::Watermarks;

use crate::error::StoreError;

/// Identifies one materialized projection: per tenant, per projection name,
/// and either tenant-wide (`aggregate_id = None`) or for a single aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectionKey {
    pub tenant_id: TenantId,
    pub name: String,
    pub aggregate_id: Option<AggregateId>,
}

impl ProjectionKey {
    pub fn new(tenant_id: TenantId, name: impl Into<String>, aggregate_id: Option<AggregateId>) -> Self {
        Self {
            tenant_id,
            name: name.into(),
            aggregate_id,
        }
    }
}

impl fmt::Display for ProjectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.aggregate_id {
            Some(aggregate_id) => write!(f, "{}/{}/{}", self.tenant_id, self.name, aggregate_id),
            None => write!(f, "{}/{}", self.tenant_id, self.name),
        }
    }
}

/// Lifecycle of a materialized projection.
///
/// `Absent → Building → Ready`, then `Ready → Stale → Building → Ready` on
/// every rebuild. `Absent` is never stored; it is what a missing record reads as.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProjectionStatus {
    Absent,
    Building,
    Ready,
    Stale,
}

impl ProjectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectionStatus::Absent => "absent",
            ProjectionStatus::Building => "building",
            ProjectionStatus::Ready => "ready",
            ProjectionStatus::Stale => "stale",
        }
    }
}

impl fmt::Display for ProjectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absent" => Ok(ProjectionStatus::Absent),
            "building" => Ok(ProjectionStatus::Building),
            "ready" => Ok(ProjectionStatus::Ready),
            "stale" => Ok(ProjectionStatus::Stale),
            other => Err(StoreError::Integrity(format!("unknown projection status '{other}'"))),
        }
    }
}

/// Stored projection record.
///
/// `state` and `watermarks` always describe the last *published* build; a
/// rebuild in progress only changes `status` and `generation` until it
/// publishes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionRecord {
    pub key: ProjectionKey,
    pub status: ProjectionStatus,
    pub state: Option<JsonValue>,
    pub watermarks: Watermarks,
    pub generation: u64,
    pub updated_at: DateTime<Utc>,
}

/// Persistence for projection records, scoped to the session's tenant.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    async fn load(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
    ) -> Result<Option<ProjectionRecord>, StoreError>;

    /// Enter `Building`, creating the record if needed. Bumps and returns the
    /// generation the eventual `publish` must present.
    async fn begin_build(&self, ctx: &SessionContext, key: &ProjectionKey)
    -> Result<u64, StoreError>;

    /// Store `state` as `Ready` if the record is still at `generation`.
    /// Returns `false` when a newer build has started since.
    async fn publish(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
        generation: u64,
        state: JsonValue,
        watermarks: Watermarks,
    ) -> Result<bool, StoreError>;

    /// Change the status of an existing record; a no-op when there is none.
    async fn set_status(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
        status: ProjectionStatus,
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> ProjectionStore for Arc<S>
where
    S: ProjectionStore + ?Sized,
{
    async fn load(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
    ) -> Result<Option<ProjectionRecord>, StoreError> {
        (**self).load(ctx, key).await
    }

    async fn begin_build(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
    ) -> Result<u64, StoreError> {
        (**self).begin_build(ctx, key).await
    }

    async fn publish(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
        generation: u64,
        state: JsonValue,
        watermarks: Watermarks,
    ) -> Result<bool, StoreError> {
        (**self)
            .publish(ctx, key, generation, state, watermarks)
            .await
    }

    async fn set_status(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
        status: ProjectionStatus,
    ) -> Result<(), StoreError> {
        (**self).set_status(ctx, key, status).await
    }
}

/// Resolve the session tenant and make sure `key` belongs to it.
pub(crate) fn require_key_tenant(
    ctx: &SessionContext,
    key: &ProjectionKey,
) -> Result<TenantId, StoreError> {
    let tenant_id = ctx.require_tenant()?;
    if key.tenant_id != tenant_id {
        return Err(StoreError::TenantIsolation(format!(
            "projection {key} requested by a session bound to tenant {tenant_id}"
        )));
    }
    Ok(tenant_id)
}
