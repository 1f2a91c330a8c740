use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::shared::base::is_valid_partition_key;
use crate::shared::{
    BatchConfig, DimensionConfig, EntitySchemaConfig, LeaseConfig, RetryConfig, ValidationError,
};

/// Settings of a medallion pipeline shared by every stage.
#[derive(Clone, Debug, Deserialize)]
pub struct PipelineConfig {
    /// Identifier used to isolate the state of different pipelines.
    pub id: u64,
    /// Partition keys whose change events are consumed by this process.
    #[serde(default)]
    pub partitions: Vec<String>,
    /// Consumer batching settings.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Backoff applied to transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Exclusive lease settings.
    #[serde(default)]
    pub lease: LeaseConfig,
    /// Deadline bounding each blocking operation, in milliseconds.
    #[serde(default = "default_operation_deadline_ms")]
    pub operation_deadline_ms: u64,
    /// Maximum number of raw records read by a single merge window.
    #[serde(default = "default_merge_window_size")]
    pub merge_window_size: usize,
    /// Snapshot settings per dimension.
    #[serde(default)]
    pub dimensions: Vec<DimensionConfig>,
    /// Ingestion contracts per entity.
    #[serde(default)]
    pub schemas: Vec<EntitySchemaConfig>,
}

fn default_operation_deadline_ms() -> u64 {
    PipelineConfig::DEFAULT_OPERATION_DEADLINE_MS
}

fn default_merge_window_size() -> usize {
    PipelineConfig::DEFAULT_MERGE_WINDOW_SIZE
}

impl PipelineConfig {
    pub const DEFAULT_OPERATION_DEADLINE_MS: u64 = 60_000;

    pub const DEFAULT_MERGE_WINDOW_SIZE: usize = 10_000;

    pub fn operation_deadline(&self) -> Duration {
        Duration::from_millis(self.operation_deadline_ms)
    }

    /// Returns the tracked attributes configured for `entity`, empty when all are tracked.
    pub fn tracked_attributes(&self, entity: &str) -> &[String] {
        self.dimensions
            .iter()
            .find(|dimension| dimension.entity == entity)
            .map(|dimension| dimension.tracked_attributes.as_slice())
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.batch.validate()?;
        self.retry.validate()?;
        self.lease.validate()?;

        if self.operation_deadline_ms == 0 {
            return Err(ValidationError::invalid(
                "pipeline.operation_deadline_ms",
                "must be greater than 0",
            ));
        }

        if self.merge_window_size == 0 {
            return Err(ValidationError::invalid(
                "pipeline.merge_window_size",
                "must be greater than 0",
            ));
        }

        let mut partitions = HashSet::new();
        for partition in &self.partitions {
            if !is_valid_partition_key(partition) {
                return Err(ValidationError::InvalidPartitionKey(partition.clone()));
            }
            if !partitions.insert(partition.as_str()) {
                return Err(ValidationError::DuplicatePartition(partition.clone()));
            }
        }

        let mut dimensions = HashSet::new();
        for dimension in &self.dimensions {
            if !dimensions.insert(dimension.entity.as_str()) {
                return Err(ValidationError::DuplicateEntity(
                    dimension.entity.clone(),
                    "pipeline.dimensions",
                ));
            }
        }

        let mut schemas = HashSet::new();
        for schema in &self.schemas {
            if !schemas.insert(schema.entity.as_str()) {
                return Err(ValidationError::DuplicateEntity(
                    schema.entity.clone(),
                    "pipeline.schemas",
                ));
            }
        }

        Ok(())
    }
}
