use medallion_config::shared::{
    BatchConfig, DimensionConfig, EntitySchemaConfig, LeaseConfig, PipelineConfig, RetryConfig,
};

/// Returns a pipeline configuration with short backoffs and generous deadlines.
///
/// Batches flush at 100 events or after 50ms.
pub fn test_pipeline_config(partitions: &[&str]) -> PipelineConfig {
    PipelineConfig {
        id: 1,
        partitions: partitions.iter().map(|p| p.to_string()).collect(),
        batch: BatchConfig {
            max_size: 100,
            max_fill_ms: 50,
            max_buffered_events: 1_000,
        },
        retry: RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 10,
            backoff_multiplier: 2.0,
            max_attempts: 5,
        },
        lease: LeaseConfig {
            ttl_ms: 30_000,
            acquire_timeout_ms: 2_000,
        },
        operation_deadline_ms: 5_000,
        merge_window_size: 100,
        dimensions: vec![],
        schemas: vec![],
    }
}

/// Tracks `attributes` of `entity` for change detection.
pub fn with_dimension(
    mut config: PipelineConfig,
    entity: &str,
    attributes: &[&str],
) -> PipelineConfig {
    config.dimensions.push(DimensionConfig {
        entity: entity.to_string(),
        tracked_attributes: attributes.iter().map(|a| a.to_string()).collect(),
    });

    config
}

/// Registers a schema for `entity`.
pub fn with_schema(
    mut config: PipelineConfig,
    entity: &str,
    schema_version: u32,
    required_fields: &[&str],
) -> PipelineConfig {
    config.schemas.push(EntitySchemaConfig {
        entity: entity.to_string(),
        schema_version,
        required_fields: required_fields.iter().map(|f| f.to_string()).collect(),
    });

    config
}
