use medallion_config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::{Connection, Executor, PgConnection, PgPool};

use crate::pool::{connect_warehouse, migrate_warehouse};

/// Creates a new Postgres database, runs the warehouse migrations on it and returns a pool.
///
/// # Panics
/// Panics if connection, database creation or migration fails.
pub async fn create_warehouse_database(config: &PgConnectionConfig) -> PgPool {
    let mut connection = PgConnection::connect_with(&config.without_db())
        .await
        .expect("Failed to connect to Postgres");
    connection
        .execute(&*format!(r#"create database "{}";"#, config.name))
        .await
        .expect("Failed to create database");

    let pool = connect_warehouse(config, 4)
        .await
        .expect("Failed to connect to the warehouse database");
    migrate_warehouse(&pool)
        .await
        .expect("Failed to migrate the warehouse database");

    pool
}

/// Drops a Postgres database after terminating its connections. Failures are only printed so
/// cleanup never fails a test.
pub async fn drop_warehouse_database(config: &PgConnectionConfig) {
    let mut connection = match PgConnection::connect_with(&config.without_db()).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("warning: failed to connect to Postgres for cleanup: {e}");
            return;
        }
    };

    if let Err(e) = connection
        .execute(&*format!(
            r#"
            select pg_terminate_backend(pg_stat_activity.pid)
            from pg_stat_activity
            where pg_stat_activity.datname = '{}'
            and pid <> pg_backend_pid();"#,
            config.name
        ))
        .await
    {
        eprintln!(
            "warning: failed to terminate connections for database {}: {}",
            config.name, e
        );
    }

    if let Err(e) = connection
        .execute(&*format!(r#"drop database if exists "{}";"#, config.name))
        .await
    {
        eprintln!("warning: failed to drop database {}: {}", config.name, e);
    }
}
