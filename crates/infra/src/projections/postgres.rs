//! Postgres-backed projection records.
//!
//! Tenant-wide projections are stored with the nil UUID in `aggregate_id` so
//! the column can be part of the primary key. Watermarks (versions per
//! aggregate and the highest folded position) are kept as JSONB.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use eventvault_core::{DomainError, SessionContext};
use eventvault_events::Watermarks;

use super::store::{
    ProjectionKey, ProjectionRecord, ProjectionStatus, ProjectionStore, require_key_tenant,
};
use crate::error::StoreError;
use crate::pg::{begin_scoped, commit, map_sqlx_error};

#[derive(Debug, Clone)]
pub struct PostgresProjectionStore {
    pool: Arc<PgPool>,
}

impl PostgresProjectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn aggregate_column(key: &ProjectionKey) -> Uuid {
    key.aggregate_id.map_or(Uuid::nil(), |id| *id.as_uuid())
}

fn generation_from_db(raw: i64) -> Result<u64, StoreError> {
    u64::try_from(raw)
        .map_err(|_| StoreError::Integrity(format!("negative projection generation {raw}")))
}

fn generation_to_db(generation: u64) -> Result<i64, StoreError> {
    i64::try_from(generation)
        .map_err(|_| StoreError::Integrity(format!("generation {generation} exceeds storage range")))
}

#[async_trait]
impl ProjectionStore for PostgresProjectionStore {
    #[instrument(skip(self, ctx), fields(projection = %key), err)]
    async fn load(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
    ) -> Result<Option<ProjectionRecord>, StoreError> {
        require_key_tenant(ctx, key)?;
        let (mut tx, tenant_id) = begin_scoped(&self.pool, ctx).await?;

        let row = sqlx::query(
            r#"
            SELECT status, state, watermarks, generation, updated_at
            FROM projections
            WHERE tenant_id = $1 AND projection_name = $2 AND aggregate_id = $3
            "#,
        )
        .bind(tenant_id.get())
        .bind(&key.name)
        .bind(aggregate_column(key))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("load_projection", e))?;
        commit(tx, "load_projection").await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let get_err = |e| map_sqlx_error("decode_projection", e);

        let status: String = row.try_get("status").map_err(get_err)?;
        let watermarks: JsonValue = row.try_get("watermarks").map_err(get_err)?;
        let watermarks: Watermarks = serde_json::from_value(watermarks)?;

        Ok(Some(ProjectionRecord {
            key: key.clone(),
            status: status.parse()?,
            state: row.try_get("state").map_err(get_err)?,
            watermarks,
            generation: generation_from_db(row.try_get("generation").map_err(get_err)?)?,
            updated_at: row.try_get("updated_at").map_err(get_err)?,
        }))
    }

    #[instrument(skip(self, ctx), fields(projection = %key), err)]
    async fn begin_build(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
    ) -> Result<u64, StoreError> {
        require_key_tenant(ctx, key)?;
        let (mut tx, tenant_id) = begin_scoped(&self.pool, ctx).await?;

        let row = sqlx::query(
            r#"
            INSERT INTO projections (tenant_id, projection_name, aggregate_id, status, generation)
            VALUES ($1, $2, $3, 'building', 1)
            ON CONFLICT (tenant_id, projection_name, aggregate_id)
            DO UPDATE SET
                status = 'building',
                generation = projections.generation + 1,
                updated_at = NOW()
            RETURNING generation
            "#,
        )
        .bind(tenant_id.get())
        .bind(&key.name)
        .bind(aggregate_column(key))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("begin_build", e))?;
        commit(tx, "begin_build").await?;

        let generation: i64 = row
            .try_get("generation")
            .map_err(|e| map_sqlx_error("begin_build", e))?;
        generation_from_db(generation)
    }

    #[instrument(skip(self, ctx, state, watermarks), fields(projection = %key), err)]
    async fn publish(
        &self,
        ctx: &SessionContext,
        key: &ProjectionKey,
        generation: u64,
        state: JsonValue,
        watermarks: Watermarks,
    ) -> Result<bool, StoreError> {
        require_key_tenant(ctx, key)?;
        let watermarks = serde_json::to_value(&watermarks)?;
        let (mut tx, tenant_id) = begin_scoped(&self.pool, ctx).await?;

        let result = sqlx::query(
            r#"
            UPDATE projections
            SET status = 'ready', state = $5, watermarks = $6, updated_at = NOW()
            WHERE tenant_id = $1
              AND projection_name = $2
              AND aggregate_id = $3
              AND generation = $4
            "#,
        )
        .bind(tenant_id.get())
        .bind(&key.name)
        .bind(aggregate_column(key))
        .bind(generation_to_db(generation)?)
        .bind(&state)
        .bind(&watermarks)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("publish_projection", e))?;
        commit(tx, "publish_projection").await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, ctx), fields(projection = %key), err)]
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
        let (mut tx, tenant_id) = begin_scoped(&self.pool, ctx).await?;

        sqlx::query(
            r#"
            UPDATE projections
            SET status = $4, updated_at = NOW()
            WHERE tenant_id = $1 AND projection_name = $2 AND aggregate_id = $3
            "#,
        )
        .bind(tenant_id.get())
        .bind(&key.name)
        .bind(aggregate_column(key))
        .bind(status.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("set_projection_status", e))?;

        commit(tx, "set_projection_status").await
    }
}
