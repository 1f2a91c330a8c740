//! Metric names and labels emitted by the pipeline stages.

/// Label for the partition key in metrics.
pub const PARTITION_LABEL: &str = "partition";

/// Label for the entity in metrics.
pub const ENTITY_LABEL: &str = "entity";

/// Label for the fact table in metrics.
pub const FACT_TABLE_LABEL: &str = "fact_table";

/// Label for the operation name in retry metrics.
pub const OPERATION_LABEL: &str = "operation";

/// Label for the quarantine reason.
pub const REASON_LABEL: &str = "reason";

/// Label for the quarantine stage.
pub const STAGE_LABEL: &str = "stage";

// Consumer

/// Counter for change events written to the staging store.
pub const MEDALLION_EVENTS_STAGED_TOTAL: &str = "medallion_events_staged_total";

/// Counter for staged objects written, including the ones that already existed.
pub const MEDALLION_STAGED_OBJECTS_TOTAL: &str = "medallion_staged_objects_total";

/// Gauge for events held in memory by a consumer, sealed and open.
pub const MEDALLION_CONSUMER_BUFFERED_EVENTS: &str = "medallion_consumer_buffered_events";

/// Gauge for the last committed cursor offset of a partition.
pub const MEDALLION_CONSUMER_COMMITTED_OFFSET: &str = "medallion_consumer_committed_offset";

// Bronze

/// Counter for staged objects loaded into the raw store.
pub const MEDALLION_OBJECTS_LOADED_TOTAL: &str = "medallion_objects_loaded_total";

/// Counter for staged objects skipped because they were already loaded.
pub const MEDALLION_OBJECTS_SKIPPED_TOTAL: &str = "medallion_objects_skipped_total";

/// Counter for raw records inserted.
pub const MEDALLION_RAW_RECORDS_LOADED_TOTAL: &str = "medallion_raw_records_loaded_total";

/// Counter for records set aside in quarantine.
pub const MEDALLION_RECORDS_QUARANTINED_TOTAL: &str = "medallion_records_quarantined_total";

// Merge, snapshot and facts

/// Counter for conformed records upserted by merge windows.
pub const MEDALLION_CONFORMED_UPSERTS_TOTAL: &str = "medallion_conformed_upserts_total";

/// Gauge for the merge watermark of an entity.
pub const MEDALLION_MERGE_WATERMARK: &str = "medallion_merge_watermark";

/// Counter for dimension versions opened.
pub const MEDALLION_DIMENSION_VERSIONS_OPENED_TOTAL: &str =
    "medallion_dimension_versions_opened_total";

/// Counter for dimension versions closed.
pub const MEDALLION_DIMENSION_VERSIONS_CLOSED_TOTAL: &str =
    "medallion_dimension_versions_closed_total";

/// Counter for fact rows inserted or updated.
pub const MEDALLION_FACTS_UPSERTED_TOTAL: &str = "medallion_facts_upserted_total";

// Retries

/// Counter for retried attempts of blocking operations.
pub const MEDALLION_RETRY_ATTEMPTS_TOTAL: &str = "medallion_retry_attempts_total";
