//! Bronze loader: moves staged objects into the raw store exactly once.

use std::sync::Arc;

use medallion_config::shared::PipelineConfig;
use tracing::{debug, info, warn};

use crate::concurrency::lease::{LeaseManager, LeaseScope, LeaseStage, LeaseStore};
use crate::concurrency::retry::Retrier;
use crate::concurrency::shutdown::{ShutdownRx, is_shutdown_requested};
use crate::error::EtlResult;
use crate::failpoints::{BRONZE_LOAD__BEFORE_COMMIT, etl_fail_point};
use crate::metrics::{
    ENTITY_LABEL, MEDALLION_OBJECTS_LOADED_TOTAL, MEDALLION_OBJECTS_SKIPPED_TOTAL,
    MEDALLION_RAW_RECORDS_LOADED_TOTAL, MEDALLION_RECORDS_QUARANTINED_TOTAL, REASON_LABEL,
    STAGE_LABEL,
};
use crate::schema::SchemaRegistry;
use crate::staging::StagingStore;
use crate::store::warehouse::{LoadOutcome, RawStore};
use crate::types::{
    ChangeEvent, QuarantineReason, QuarantineStage, QuarantinedRecord, STAGED_PREFIX,
    StagedBatch, StagedObjectName,
};

/// Key of the single bronze lease. The loaded set spans every partition.
const BRONZE_LEASE_KEY: &str = "staged";

/// Summary of a [`BronzeLoader::load_new`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    /// Staged objects loaded in this pass.
    pub loaded_objects: usize,
    /// Staged objects that were already in the loaded set.
    pub skipped_objects: usize,
    /// Raw records inserted.
    pub raw_records: usize,
    /// Events already present as raw records from an overlapping object.
    pub duplicates: usize,
    /// Events quarantined for violating their schema.
    pub quarantined: usize,
}

/// Loads staged objects that are not in the loaded set yet.
///
/// Every object is loaded in one atomic unit together with its loaded-set entry, so a pass
/// interrupted at any point can simply be run again.
#[derive(Debug)]
pub struct BronzeLoader<St, W, L> {
    staging: St,
    warehouse: W,
    schemas: SchemaRegistry,
    leases: LeaseManager<L>,
    retrier: Retrier,
    shutdown_rx: ShutdownRx,
}

impl<St, W, L> BronzeLoader<St, W, L>
where
    St: StagingStore + Clone + Send + Sync + 'static,
    W: RawStore + Clone + Send + Sync + 'static,
    L: LeaseStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        config: Arc<PipelineConfig>,
        staging: St,
        warehouse: W,
        leases: LeaseManager<L>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        let retrier = Retrier::new(
            config.retry.clone(),
            config.operation_deadline(),
            shutdown_rx.clone(),
        );

        Self {
            staging,
            warehouse,
            schemas: SchemaRegistry::new(config.schemas.iter().cloned()),
            leases,
            retrier,
            shutdown_rx,
        }
    }

    /// Loads every staged object not yet recorded as loaded, in name order.
    pub async fn load_new(&self) -> EtlResult<LoadSummary> {
        let lease = self
            .leases
            .acquire(LeaseScope::new(LeaseStage::Bronze, BRONZE_LEASE_KEY))
            .await?;

        let result = self.load_new_locked().await;
        lease.release().await?;

        result
    }

    async fn load_new_locked(&self) -> EtlResult<LoadSummary> {
        let loaded = self
            .retrier
            .run("list_loaded_objects", || self.warehouse.loaded_object_names())
            .await?;
        let staged = self
            .retrier
            .run("list_staged_objects", || self.staging.list(STAGED_PREFIX))
            .await?;

        let mut summary = LoadSummary::default();
        for name in staged {
            if loaded.contains(&name) {
                summary.skipped_objects += 1;
                continue;
            }

            let parsed = match name.parse::<StagedObjectName>() {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(object = %name, error = %err, "ignoring unrecognized staged object");
                    continue;
                }
            };

            if is_shutdown_requested(&self.shutdown_rx) {
                info!("shutdown requested, stopping bronze load");
                break;
            }

            self.load_object(&name, &parsed, &mut summary).await?;
        }

        metrics::counter!(MEDALLION_OBJECTS_SKIPPED_TOTAL)
            .increment(summary.skipped_objects as u64);
        info!(
            loaded = summary.loaded_objects,
            skipped = summary.skipped_objects,
            raw_records = summary.raw_records,
            duplicates = summary.duplicates,
            quarantined = summary.quarantined,
            "bronze load completed"
        );

        Ok(summary)
    }

    async fn load_object(
        &self,
        name: &str,
        parsed: &StagedObjectName,
        summary: &mut LoadSummary,
    ) -> EtlResult<()> {
        let bytes = self
            .retrier
            .run("get_staged_object", || self.staging.get(name))
            .await?;
        // Undecodable objects are not retried: the bytes will not change.
        let batch = StagedBatch::decode(parsed, &bytes)?;

        let mut events = Vec::with_capacity(batch.len());
        let mut quarantined = Vec::new();
        for event in batch.into_events() {
            match self.schemas.validate(&event) {
                Ok(()) => events.push(event),
                Err(detail) => quarantined.push(schema_violation(event, detail)?),
            }
        }

        let outcome = self
            .retrier
            .run("load_staged_object", || {
                let events = events.clone();
                let quarantined = quarantined.clone();
                async move {
                    etl_fail_point(BRONZE_LOAD__BEFORE_COMMIT)?;
                    self.warehouse
                        .load_staged_object(name, events, quarantined)
                        .await
                }
            })
            .await?;

        match outcome {
            LoadOutcome::Loaded {
                raw_records,
                duplicates,
                quarantined: quarantined_count,
            } => {
                summary.loaded_objects += 1;
                summary.raw_records += raw_records;
                summary.duplicates += duplicates;
                summary.quarantined += quarantined_count;

                metrics::counter!(MEDALLION_OBJECTS_LOADED_TOTAL).increment(1);
                metrics::counter!(MEDALLION_RAW_RECORDS_LOADED_TOTAL)
                    .increment(raw_records as u64);
                count_quarantined(&quarantined);
                debug!(
                    object = %name,
                    raw_records,
                    duplicates,
                    quarantined = quarantined_count,
                    "loaded staged object"
                );
            }
            LoadOutcome::AlreadyLoaded => {
                // Another loader recorded the object between listing and loading.
                summary.skipped_objects += 1;
                debug!(object = %name, "staged object was loaded concurrently");
            }
        }

        Ok(())
    }
}

/// Counts quarantined records once their object is committed.
fn count_quarantined(records: &[QuarantinedRecord]) {
    for record in records {
        metrics::counter!(
            MEDALLION_RECORDS_QUARANTINED_TOTAL,
            STAGE_LABEL => QuarantineStage::Bronze.as_str(),
            REASON_LABEL => record.reason.as_str(),
            ENTITY_LABEL => record.scope.clone()
        )
        .increment(1);
    }
}

fn schema_violation(event: ChangeEvent, detail: String) -> EtlResult<QuarantinedRecord> {
    warn!(
        entity = %event.entity,
        partition = %event.partition_key,
        offset = event.offset,
        %detail,
        "quarantining event that violates its schema"
    );

    Ok(QuarantinedRecord {
        stage: QuarantineStage::Bronze,
        scope: event.entity.clone(),
        record_ref: format!("{}:{}", event.partition_key, event.offset),
        reason: QuarantineReason::SchemaViolation,
        detail,
        payload: serde_json::to_value(&event)?,
        quarantined_at: None,
    })
}
