//! Shared configuration types for medallion pipelines.

mod base;
mod batch;
mod connection;
mod dimension;
mod lease;
mod pipeline;
mod retry;
mod runner;
mod stores;

pub use base::ValidationError;
pub use batch::BatchConfig;
pub use connection::{DefaultPgConnectionOptions, IntoConnectOptions, PgConnectionConfig, TlsConfig};
pub use dimension::{DimensionConfig, EntitySchemaConfig};
pub use lease::LeaseConfig;
pub use pipeline::PipelineConfig;
pub use retry::RetryConfig;
pub use runner::RunnerConfig;
pub use stores::{SourceConfig, StagingConfig, WarehouseConfig, WatermarkStoreConfig};
