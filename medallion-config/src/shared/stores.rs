use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::shared::{PgConnectionConfig, ValidationError};

/// Where per-partition load cursors are persisted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkStoreConfig {
    /// Process-local cursors, lost on restart.
    #[default]
    Memory,
    /// One JSON document per partition under `path`.
    File { path: PathBuf },
    /// Cursor table in the warehouse database.
    Postgres,
}

/// Backing storage for staged objects.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingConfig {
    #[default]
    Memory,
    FileSystem { root: PathBuf },
}

/// Warehouse holding raw, conformed, dimension and fact tables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseConfig {
    #[default]
    Memory,
    Postgres {
        #[serde(flatten)]
        connection: PgConnectionConfig,
        /// Maximum number of pooled connections.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    WarehouseConfig::DEFAULT_MAX_CONNECTIONS
}

impl WarehouseConfig {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            WarehouseConfig::Memory => Ok(()),
            WarehouseConfig::Postgres {
                connection,
                max_connections,
            } => {
                connection.validate()?;
                if *max_connections == 0 {
                    return Err(ValidationError::invalid(
                        "warehouse.max_connections",
                        "must be greater than 0",
                    ));
                }

                Ok(())
            }
        }
    }
}

/// Change event source feeding the consumer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceConfig {
    /// Newline-delimited JSON change events in `{root}/{partition}.jsonl`, tailed by polling.
    FileSystem {
        root: PathBuf,
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        match self {
            SourceConfig::FileSystem {
                poll_interval_ms, ..
            } => Duration::from_millis(*poll_interval_ms),
        }
    }
}
