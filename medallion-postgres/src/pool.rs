use medallion_config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use thiserror::Error;
use tracing::info;

use crate::WAREHOUSE_SCHEMA;

/// Errors raised while preparing the warehouse database.
#[derive(Debug, Error)]
pub enum WarehouseSetupError {
    #[error("failed to connect to the warehouse database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("failed to run warehouse migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Connects to the warehouse database.
///
/// Every pooled connection gets the warehouse schema created and selected as its search path,
/// so unqualified table names resolve to it.
pub async fn connect_warehouse(
    config: &PgConnectionConfig,
    max_connections: u32,
) -> Result<PgPool, WarehouseSetupError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute(format!("create schema if not exists {WAREHOUSE_SCHEMA};").as_str())
                    .await?;
                conn.execute(format!("set search_path = '{WAREHOUSE_SCHEMA}';").as_str())
                    .await?;
                Ok(())
            })
        })
        .connect_with(config.with_db())
        .await
        .map_err(WarehouseSetupError::Connect)?;

    Ok(pool)
}

/// Runs the embedded warehouse migrations.
pub async fn migrate_warehouse(pool: &PgPool) -> Result<(), WarehouseSetupError> {
    let migrator = sqlx::migrate!("./migrations");
    migrator.run(pool).await?;

    info!(schema = WAREHOUSE_SCHEMA, "warehouse migrations applied");

    Ok(())
}
