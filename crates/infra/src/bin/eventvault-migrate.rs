//! Apply the EventVault schema to the database named by `DATABASE_URL`.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use eventvault_infra::StoreConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eventvault_observability::init();

    let config = StoreConfig::from_env().context("invalid EVENTVAULT_* configuration")?;
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    eventvault_infra::pg::migrate(&pool)
        .await
        .context("failed to apply schema")?;

    tracing::info!(
        snapshot_retain = config.snapshots.retain(),
        page_size = config.page_size(),
        "eventvault schema is up to date"
    );
    Ok(())
}
