use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;

use eventvault_core::{DomainError, SessionContext};
use eventvault_events::Watermarks;

use super::store::{
    ProjectionKey, ProjectionRecord, ProjectionStatus, ProjectionStore, require_key_tenant,
};
use crate::error::StoreError;

/// In-memory projection store (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryProjectionStore {
    records: RwLock<HashMap<ProjectionKey, ProjectionRecord>>,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn load(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
    ) -> Result<Option<ProjectionRecord>, StoreError> {
        require_key_tenant(ctx, key)?;
        let records = self.records.read().map_err(|_| StoreError::poisoned("projections"))?;
        Ok(records.get(key).cloned())
    }

    async fn begin_build(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
    ) -> Result<u64, StoreError> {
        require_key_tenant(ctx, key)?;
        let mut records = self.records.write().map_err(|_| StoreError::poisoned("projections"))?;
        let record = records.entry(key.clone()).or_insert_with(|| ProjectionRecord {
            key: key.clone(),
            status: ProjectionStatus::Building,
            state: None,
            watermarks: Watermarks::default(),
            generation: 0,
            updated_at: Utc::now(),
        });
        record.status = ProjectionStatus::Building;
        record.generation += 1;
        record.updated_at = Utc::now();
        Ok(record.generation)
    }

    async fn publish(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
        generation: u64,
        state: JsonValue,
        watermarks: Watermarks,
    ) -> Result<bool, StoreError> {
        require_key_tenant(ctx, key)?;
        let mut records = self.records.write().map_err(|_| StoreError::poisoned("projections"))?;
        let Some(record) = records.get_mut(key) else {
            return Ok(false);
        };
        if record.generation != generation {
            return Ok(false);
        }
        record.status = ProjectionStatus::Ready;
        record.state = Some(state);
        record.watermarks = watermarks;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_status(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
        status: ProjectionStatus,
    ) -> Result<(), StoreError> {
        require_key_tenant(ctx, key)?;
        if status == ProjectionStatus::Absent {
            return Err(DomainError::validation("absent is not a storable projection status").into());
        }
        let mut records = self.records.write().map_err(|_| StoreError::poisoned("projections"))?;
        if let Some(record) = records.get_mut(key) {
            record.status = status;
            record.updated_at = Utc::now();
        }
        Ok(())
    }
}
