//! Postgres-backed snapshot store.
//!
//! Rows live in `snapshots`, unique on `(tenant_id, aggregate_id,
//! snapshot_version)`; inserting at an existing version overwrites the row.
//! Pruning is a single `DELETE` keeping the newest `keep` versions.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use eventvault_core::{AggregateId, SessionContext};

use super::store::{Snapshot, SnapshotStore, ensure_same_tenant};
use crate::error::StoreError;
use crate::pg::{begin_scoped, commit, from_db_version, map_sqlx_error, tenant_from_db, to_db_version};

#[derive(Debug, Clone)]
pub struct PostgresSnapshotStore {
    pool: Arc<PgPool>,
}

impl PostgresSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

const SELECT_COLUMNS: &str =
    "SELECT snapshot_id, tenant_id, aggregate_id, snapshot_version, state, created_at FROM snapshots";

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    #[instrument(
        skip(self, ctx, snapshot),
        fields(
            tenant_id = ?ctx.current_tenant(),
            aggregate_id = %snapshot.aggregate_id,
            snapshot_version = snapshot.snapshot_version
        ),
        err
    )]
    async fn insert(&self, ctx: &SessionContext, snapshot: Snapshot) -> Result<(), StoreError> {
        let (mut tx, tenant_id) = begin_scoped(&self.pool, ctx).await?;
        ensure_same_tenant(tenant_id, &snapshot)?;

        sqlx::query(
            r#"
            INSERT INTO snapshots (
                snapshot_id,
                tenant_id,
                aggregate_id,
                snapshot_version,
                state,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, aggregate_id, snapshot_version)
            DO UPDATE SET
                snapshot_id = EXCLUDED.snapshot_id,
                state = EXCLUDED.state,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(snapshot.snapshot_id)
        .bind(tenant_id.get())
        .bind(snapshot.aggregate_id.as_uuid())
        .bind(to_db_version(snapshot.snapshot_version)?)
        .bind(&snapshot.state)
        .bind(snapshot.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_snapshot", e))?;

        commit(tx, "insert_snapshot").await
    }

    #[instrument(skip(self, ctx), fields(tenant_id = ?ctx.current_tenant(), aggregate_id = %aggregate_id), err)]
    async fn latest(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, StoreError> {
        let (mut tx, tenant_id) = begin_scoped(&self.pool, ctx).await?;

        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE tenant_id = $1 AND aggregate_id = $2 \
             ORDER BY snapshot_version DESC LIMIT 1"
        ))
        .bind(tenant_id.get())
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("latest_snapshot", e))?;
        commit(tx, "latest_snapshot").await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    #[instrument(skip(self, ctx), fields(tenant_id = ?ctx.current_tenant(), aggregate_id = %aggregate_id), err)]
    async fn list(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let (mut tx, tenant_id) = begin_scoped(&self.pool, ctx).await?;

        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE tenant_id = $1 AND aggregate_id = $2 \
             ORDER BY snapshot_version DESC"
        ))
        .bind(tenant_id.get())
        .bind(aggregate_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("list_snapshots", e))?;
        commit(tx, "list_snapshots").await?;

        rows.iter().map(snapshot_from_row).collect()
    }

    #[instrument(skip(self, ctx), fields(tenant_id = ?ctx.current_tenant(), aggregate_id = %aggregate_id), err)]
    async fn prune(
        &self,
        ctx: &SessionContext,
        aggregate_id: AggregateId,
        keep: usize,
    ) -> Result<usize, StoreError> {
        let (mut tx, tenant_id) = begin_scoped(&self.pool, ctx).await?;

        let result = sqlx::query(
            r#"
            DELETE FROM snapshots
            WHERE tenant_id = $1
              AND aggregate_id = $2
              AND snapshot_version NOT IN (
                  SELECT snapshot_version
                  FROM snapshots
                  WHERE tenant_id = $1 AND aggregate_id = $2
                  ORDER BY snapshot_version DESC
                  LIMIT $3
              )
            "#,
        )
        .bind(tenant_id.get())
        .bind(aggregate_id.as_uuid())
        .bind(i64::try_from(keep).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("prune_snapshots", e))?;
        commit(tx, "prune_snapshots").await?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot, StoreError> {
    let get_err = |e| map_sqlx_error("decode_snapshot", e);

    Ok(Snapshot {
        snapshot_id: row.try_get("snapshot_id").map_err(get_err)?,
        tenant_id: tenant_from_db(row.try_get("tenant_id").map_err(get_err)?)?,
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(get_err)?),
        snapshot_version: from_db_version(row.try_get("snapshot_version").map_err(get_err)?)?,
        state: row.try_get("state").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
    })
}
