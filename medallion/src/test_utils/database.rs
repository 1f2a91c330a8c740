use medallion_config::shared::{PgConnectionConfig, TlsConfig};
use medallion_postgres::test_utils::{create_warehouse_database, drop_warehouse_database};
use sqlx::PgPool;
use uuid::Uuid;

use crate::store::postgres::{PostgresCursorStore, PostgresLeaseStore, PostgresWarehouse};

/// Connection configuration of a uniquely named database on the test server.
///
/// The server is read from `TESTS_DATABASE_HOST`, `TESTS_DATABASE_PORT`,
/// `TESTS_DATABASE_USERNAME` and the optional `TESTS_DATABASE_PASSWORD`.
fn local_pg_connection_config() -> PgConnectionConfig {
    PgConnectionConfig {
        host: std::env::var("TESTS_DATABASE_HOST").expect("TESTS_DATABASE_HOST must be set"),
        port: std::env::var("TESTS_DATABASE_PORT")
            .expect("TESTS_DATABASE_PORT must be set")
            .parse()
            .expect("TESTS_DATABASE_PORT must be a valid port number"),
        name: Uuid::new_v4().to_string(),
        username: std::env::var("TESTS_DATABASE_USERNAME")
            .expect("TESTS_DATABASE_USERNAME must be set"),
        password: std::env::var("TESTS_DATABASE_PASSWORD")
            .ok()
            .map(Into::into),
        tls: TlsConfig {
            trusted_root_certs: String::new(),
            enabled: false,
        },
    }
}

/// A migrated warehouse database that lives until [`WarehouseDatabase::drop_database`].
#[derive(Debug)]
pub struct WarehouseDatabase {
    pub config: PgConnectionConfig,
    pub pool: PgPool,
}

impl WarehouseDatabase {
    pub fn warehouse(&self) -> PostgresWarehouse {
        PostgresWarehouse::new(self.pool.clone())
    }

    pub fn cursor_store(&self) -> PostgresCursorStore {
        PostgresCursorStore::new(self.pool.clone())
    }

    pub fn lease_store(&self) -> PostgresLeaseStore {
        PostgresLeaseStore::new(self.pool.clone())
    }

    pub async fn drop_database(self) {
        self.pool.close().await;
        drop_warehouse_database(&self.config).await;
    }
}

/// Creates a fresh, migrated warehouse database on the test server.
pub async fn spawn_warehouse_database() -> WarehouseDatabase {
    let config = local_pg_connection_config();
    let pool = create_warehouse_database(&config).await;

    WarehouseDatabase { config, pool }
}
