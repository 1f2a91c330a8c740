//! Store selection from the runner configuration.
//!
//! The pipeline is generic over its stores; these enums pick the implementation at startup so
//! the commands are compiled once per warehouse instead of once per store combination.

use bytes::Bytes;
use medallion::error::EtlResult;
use medallion::staging::file::FileSystemStagingStore;
use medallion::staging::memory::MemoryStagingStore;
use medallion::staging::{PutOutcome, StagingStore};
use medallion::store::cursor::CursorStore;
use medallion::store::file::FileCursorStore;
use medallion::store::memory::MemoryCursorStore;
use medallion::store::postgres::PostgresCursorStore;
use medallion::types::{LoadCursor, PartitionKey};
use medallion_config::shared::{StagingConfig, WatermarkStoreConfig};
use sqlx::PgPool;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum RunnerStagingStore {
    Memory(MemoryStagingStore),
    FileSystem(FileSystemStagingStore),
}

impl RunnerStagingStore {
    pub fn from_config(config: &StagingConfig) -> Self {
        match config {
            StagingConfig::Memory => {
                debug!("using memory staging store");
                RunnerStagingStore::Memory(MemoryStagingStore::new())
            }
            StagingConfig::FileSystem { root } => {
                debug!(root = %root.display(), "using file system staging store");
                RunnerStagingStore::FileSystem(FileSystemStagingStore::new(root.clone()))
            }
        }
    }
}

impl StagingStore for RunnerStagingStore {
    async fn put_if_absent(&self, name: &str, bytes: Bytes) -> EtlResult<PutOutcome> {
        match self {
            RunnerStagingStore::Memory(store) => store.put_if_absent(name, bytes).await,
            RunnerStagingStore::FileSystem(store) => store.put_if_absent(name, bytes).await,
        }
    }

    async fn get(&self, name: &str) -> EtlResult<Bytes> {
        match self {
            RunnerStagingStore::Memory(store) => store.get(name).await,
            RunnerStagingStore::FileSystem(store) => store.get(name).await,
        }
    }

    async fn list(&self, prefix: &str) -> EtlResult<Vec<String>> {
        match self {
            RunnerStagingStore::Memory(store) => store.list(prefix).await,
            RunnerStagingStore::FileSystem(store) => store.list(prefix).await,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RunnerCursorStore {
    Memory(MemoryCursorStore),
    File(FileCursorStore),
    Postgres(PostgresCursorStore),
}

impl RunnerCursorStore {
    /// Builds the configured cursor store. `pool` is the warehouse pool, required by the
    /// postgres variant; the configuration is validated to only ask for it when it exists.
    pub fn from_config(
        config: &WatermarkStoreConfig,
        pool: Option<&PgPool>,
    ) -> anyhow::Result<Self> {
        let store = match (config, pool) {
            (WatermarkStoreConfig::Memory, _) => {
                debug!("using memory cursor store");
                RunnerCursorStore::Memory(MemoryCursorStore::new())
            }
            (WatermarkStoreConfig::File { path }, _) => {
                debug!(path = %path.display(), "using file cursor store");
                RunnerCursorStore::File(FileCursorStore::new(path.clone()))
            }
            (WatermarkStoreConfig::Postgres, Some(pool)) => {
                debug!("using postgres cursor store");
                RunnerCursorStore::Postgres(PostgresCursorStore::new(pool.clone()))
            }
            (WatermarkStoreConfig::Postgres, None) => {
                anyhow::bail!("the postgres cursor store requires a postgres warehouse")
            }
        };

        Ok(store)
    }
}

impl CursorStore for RunnerCursorStore {
    async fn load_cursor(&self, partition_key: &PartitionKey) -> EtlResult<Option<LoadCursor>> {
        match self {
            RunnerCursorStore::Memory(store) => store.load_cursor(partition_key).await,
            RunnerCursorStore::File(store) => store.load_cursor(partition_key).await,
            RunnerCursorStore::Postgres(store) => store.load_cursor(partition_key).await,
        }
    }

    async fn commit_cursor(&self, cursor: LoadCursor) -> EtlResult<()> {
        match self {
            RunnerCursorStore::Memory(store) => store.commit_cursor(cursor).await,
            RunnerCursorStore::File(store) => store.commit_cursor(cursor).await,
            RunnerCursorStore::Postgres(store) => store.commit_cursor(cursor).await,
        }
    }
}
