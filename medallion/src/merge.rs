//! Incremental merge of raw records into the current state of each business key.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use medallion_config::shared::PipelineConfig;
use tracing::{debug, info};

use crate::bail;
use crate::concurrency::lease::{LeaseGuard, LeaseManager, LeaseScope, LeaseStage, LeaseStore};
use crate::concurrency::retry::Retrier;
use crate::concurrency::shutdown::{ShutdownRx, is_shutdown_requested};
use crate::error::{ErrorKind, EtlResult};
use crate::failpoints::{MERGE_WINDOW__BEFORE_COMMIT, etl_fail_point};
use crate::metrics::{ENTITY_LABEL, MEDALLION_CONFORMED_UPSERTS_TOTAL, MEDALLION_MERGE_WATERMARK};
use crate::store::warehouse::{ConformedStore, RawStore};
use crate::types::{ConformedRecord, Operation, RawRecord, Watermark};

/// Result of merging one window.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeWindowResult {
    /// Highest load sequence covered by the window. Pass it as `since` to merge the next one.
    pub watermark: Watermark,
    /// Raw records read in the window.
    pub raw_records: usize,
    /// Conformed records inserted or changed.
    pub upserted: usize,
}

/// Summary of [`MergeEngine::merge_until_caught_up`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    /// Windows merged.
    pub windows: usize,
    /// Raw records read across all windows.
    pub raw_records: usize,
    /// Conformed records inserted or changed across all windows.
    pub upserted: usize,
    /// Watermark after the last window.
    pub watermark: Watermark,
}

/// Folds raw records into conformed records, one bounded window at a time.
///
/// A conformed record only moves forward: an event is applied when its
/// `(commit_timestamp, offset)` version is greater than the stored one. Re-merging a window
/// that was already committed therefore leaves the conformed records untouched.
#[derive(Debug)]
pub struct MergeEngine<W, L> {
    warehouse: W,
    leases: LeaseManager<L>,
    retrier: Retrier,
    window_size: usize,
    shutdown_rx: ShutdownRx,
}

impl<W, L> MergeEngine<W, L>
where
    W: RawStore + ConformedStore + Clone + Send + Sync + 'static,
    L: LeaseStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        config: Arc<PipelineConfig>,
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
            warehouse,
            leases,
            retrier,
            window_size: config.merge_window_size,
            shutdown_rx,
        }
    }

    /// Merges the raw records of `entity` loaded after `since`, up to the configured window
    /// size, and returns the watermark the window reached.
    ///
    /// Fails with [`ErrorKind::OffsetGap`] if `since` is beyond the stored watermark, since
    /// the records in between would never be merged.
    pub async fn merge_window(
        &self,
        entity: &str,
        since: Watermark,
    ) -> EtlResult<MergeWindowResult> {
        let lease = self
            .leases
            .acquire(LeaseScope::new(LeaseStage::Merge, entity))
            .await?;

        let result = self.merge_window_locked(entity, since, &lease).await;
        lease.release().await?;

        result
    }

    /// Merges windows from the stored watermark until no raw records are left.
    pub async fn merge_until_caught_up(&self, entity: &str) -> EtlResult<MergeSummary> {
        let lease = self
            .leases
            .acquire(LeaseScope::new(LeaseStage::Merge, entity))
            .await?;

        let result = self.merge_until_caught_up_locked(entity, &lease).await;
        lease.release().await?;

        result
    }

    async fn merge_until_caught_up_locked(
        &self,
        entity: &str,
        lease: &LeaseGuard<L>,
    ) -> EtlResult<MergeSummary> {
        let mut since = self
            .retrier
            .run("load_merge_watermark", || self.warehouse.merge_watermark(entity))
            .await?;

        let mut summary = MergeSummary {
            watermark: since,
            ..MergeSummary::default()
        };
        loop {
            let window = self.merge_window_locked(entity, since, lease).await?;
            if window.raw_records == 0 {
                break;
            }

            summary.windows += 1;
            summary.raw_records += window.raw_records;
            summary.upserted += window.upserted;
            summary.watermark = window.watermark;
            since = window.watermark;

            if is_shutdown_requested(&self.shutdown_rx) {
                info!(entity, watermark = since, "shutdown requested, stopping merge");
                break;
            }
        }

        info!(
            entity,
            windows = summary.windows,
            raw_records = summary.raw_records,
            upserted = summary.upserted,
            watermark = summary.watermark,
            "entity merged"
        );

        Ok(summary)
    }

    async fn merge_window_locked(
        &self,
        entity: &str,
        since: Watermark,
        lease: &LeaseGuard<L>,
    ) -> EtlResult<MergeWindowResult> {
        let stored = self
            .retrier
            .run("load_merge_watermark", || self.warehouse.merge_watermark(entity))
            .await?;
        if since > stored {
            bail!(
                ErrorKind::OffsetGap,
                "Merge watermark would skip unmerged raw records",
                format!(
                    "Entity `{entity}` is merged up to {stored} but the window starts after {since}"
                )
            );
        }

        let raw = self
            .retrier
            .run("read_raw_records", || {
                self.warehouse.read_raw_records(entity, since, self.window_size)
            })
            .await?;
        let Some(last) = raw.last() else {
            debug!(entity, since, "no raw records to merge");
            return Ok(MergeWindowResult {
                watermark: since,
                ..MergeWindowResult::default()
            });
        };
        let watermark = last.load_sequence;

        for (expected, record) in (since + 1..).zip(&raw) {
            if record.load_sequence != expected {
                bail!(
                    ErrorKind::OffsetGap,
                    "Raw records are not contiguous",
                    format!(
                        "Expected load sequence {expected} of `{entity}` but found {}",
                        record.load_sequence
                    )
                );
            }
        }

        let mut by_key: BTreeMap<&str, Vec<&RawRecord>> = BTreeMap::new();
        for record in &raw {
            by_key.entry(&record.business_key).or_default().push(record);
        }

        let keys: Vec<String> = by_key.keys().map(|key| key.to_string()).collect();
        let existing: HashMap<String, ConformedRecord> = self
            .retrier
            .run("read_conformed_records", || {
                self.warehouse.conformed_records_for(entity, &keys)
            })
            .await?
            .into_iter()
            .map(|record| (record.business_key.clone(), record))
            .collect();

        let mut upserts = Vec::new();
        for (key, mut events) in by_key {
            events.sort_by_key(|record| record.version());

            let current = existing.get(key);
            if let Some(record) = fold_events(entity, key, current, &events) {
                upserts.push(record);
            }
        }

        let upserted = upserts.len();
        lease.renew().await?;
        self.retrier
            .run("commit_merge", || {
                let upserts = upserts.clone();
                async move {
                    etl_fail_point(MERGE_WINDOW__BEFORE_COMMIT)?;
                    self.warehouse.commit_merge(entity, upserts, watermark).await
                }
            })
            .await?;

        metrics::counter!(MEDALLION_CONFORMED_UPSERTS_TOTAL, ENTITY_LABEL => entity.to_string())
            .increment(upserted as u64);
        metrics::gauge!(MEDALLION_MERGE_WATERMARK, ENTITY_LABEL => entity.to_string())
            .set(watermark.max(stored) as f64);
        debug!(entity, since, watermark, raw_records = raw.len(), upserted, "merged window");

        Ok(MergeWindowResult {
            watermark,
            raw_records: raw.len(),
            upserted,
        })
    }
}

/// Applies `events`, sorted by version, on top of `current`. Returns the new record, or `None`
/// if no event is newer than the stored version.
fn fold_events(
    entity: &str,
    business_key: &str,
    current: Option<&ConformedRecord>,
    events: &[&RawRecord],
) -> Option<ConformedRecord> {
    let mut state = current.cloned();
    let mut changed = false;

    for event in events {
        let version = event.version();
        if state.as_ref().is_some_and(|record| version <= record.version) {
            continue;
        }

        let (attributes, active) = match event.operation {
            Operation::Insert | Operation::Update => (
                event
                    .after
                    .as_ref()
                    .map(|image| image.fields.clone())
                    .unwrap_or_default(),
                true,
            ),
            // Deletes keep the last known attributes for the audit trail.
            Operation::Delete => match &state {
                Some(record) => (record.attributes.clone(), false),
                None => (
                    event
                        .before
                        .as_ref()
                        .map(|image| image.fields.clone())
                        .unwrap_or_default(),
                    false,
                ),
            },
        };

        state = Some(ConformedRecord {
            entity: entity.to_string(),
            business_key: business_key.to_string(),
            attributes,
            version,
            active,
        });
        changed = true;
    }

    if changed { state } else { None }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use medallion_config::shared::{BatchConfig, LeaseConfig, RetryConfig};

    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::store::memory::{MemoryLeaseStore, MemoryWarehouse};
    use crate::types::{Cell, ChangeEvent, Offset, PartitionKey, RowImage};

    fn config(merge_window_size: usize) -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig {
            id: 1,
            partitions: vec!["p0".to_string()],
            batch: BatchConfig {
                max_size: 10,
                max_fill_ms: 100,
                max_buffered_events: 100,
            },
            retry: RetryConfig {
                initial_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
                max_attempts: 3,
            },
            lease: LeaseConfig {
                ttl_ms: 60_000,
                acquire_timeout_ms: 1_000,
            },
            operation_deadline_ms: 5_000,
            merge_window_size,
            dimensions: vec![],
            schemas: vec![],
        })
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn event(
        offset: Offset,
        key: &str,
        operation: Operation,
        tier: &str,
        at: DateTime<Utc>,
    ) -> ChangeEvent {
        let image = RowImage::new(1).with_field("tier", tier);
        let (before, after) = match operation {
            Operation::Delete => (Some(image), None),
            _ => (None, Some(image)),
        };

        ChangeEvent {
            partition_key: PartitionKey::new("p0").unwrap(),
            offset,
            entity: "customer".to_string(),
            operation,
            business_key: key.to_string(),
            before,
            after,
            commit_timestamp: at,
        }
    }

    async fn load(warehouse: &MemoryWarehouse, name: &str, events: Vec<ChangeEvent>) {
        warehouse
            .load_staged_object(name, events, vec![])
            .await
            .unwrap();
    }

    fn engine(
        warehouse: &MemoryWarehouse,
        window: usize,
    ) -> MergeEngine<MemoryWarehouse, MemoryLeaseStore> {
        let config = config(window);
        let (_tx, rx) = create_shutdown_channel();
        let leases = LeaseManager::new(MemoryLeaseStore::new(), config.lease.clone());

        MergeEngine::new(config, warehouse.clone(), leases, rx)
    }

    #[tokio::test]
    async fn latest_version_wins_and_delete_keeps_attributes() {
        let warehouse = MemoryWarehouse::new();
        load(
            &warehouse,
            "o1",
            vec![
                event(1, "k1", Operation::Insert, "A", ts(1)),
                event(2, "k1", Operation::Update, "B", ts(2)),
                event(3, "k1", Operation::Delete, "stale", ts(3)),
            ],
        )
        .await;

        let result = engine(&warehouse, 100).merge_window("customer", 0).await.unwrap();
        assert_eq!(result.watermark, 3);
        assert_eq!(result.upserted, 1);

        let records = warehouse.conformed_records("customer").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].active);
        assert_eq!(records[0].attributes.get("tier"), Some(&Cell::from("B")));
    }

    #[tokio::test]
    async fn out_of_order_arrival_keeps_newest_version() {
        let warehouse = MemoryWarehouse::new();
        load(&warehouse, "o1", vec![event(5, "k1", Operation::Update, "new", ts(10))]).await;
        load(&warehouse, "o2", vec![event(4, "k1", Operation::Update, "old", ts(5))]).await;

        let engine = engine(&warehouse, 1);
        let first = engine.merge_window("customer", 0).await.unwrap();
        let second = engine.merge_window("customer", first.watermark).await.unwrap();
        assert_eq!(second.watermark, 2);
        assert_eq!(second.upserted, 0);

        let records = warehouse.conformed_records("customer").await.unwrap();
        assert_eq!(records[0].attributes.get("tier"), Some(&Cell::from("new")));
    }

    #[tokio::test]
    async fn equal_commit_timestamps_fall_back_to_offset() {
        let warehouse = MemoryWarehouse::new();
        load(
            &warehouse,
            "o1",
            vec![
                event(7, "k1", Operation::Update, "higher offset", ts(5)),
                event(6, "k1", Operation::Update, "lower offset", ts(5)),
            ],
        )
        .await;

        engine(&warehouse, 100)
            .merge_window("customer", 0)
            .await
            .unwrap();

        let records = warehouse.conformed_records("customer").await.unwrap();
        assert_eq!(
            records[0].attributes.get("tier"),
            Some(&Cell::from("higher offset"))
        );
        assert_eq!(records[0].version.offset, 7);
    }

    #[tokio::test]
    async fn rerunning_a_window_is_idempotent() {
        let warehouse = MemoryWarehouse::new();
        load(
            &warehouse,
            "o1",
            vec![
                event(1, "k1", Operation::Insert, "A", ts(1)),
                event(2, "k2", Operation::Insert, "B", ts(2)),
            ],
        )
        .await;

        let engine = engine(&warehouse, 100);
        engine.merge_window("customer", 0).await.unwrap();
        let before = warehouse.conformed_records("customer").await.unwrap();

        let rerun = engine.merge_window("customer", 0).await.unwrap();
        assert_eq!(rerun.upserted, 0);
        assert_eq!(warehouse.conformed_records("customer").await.unwrap(), before);
    }

    #[tokio::test]
    async fn skipping_unmerged_records_is_an_offset_gap() {
        let warehouse = MemoryWarehouse::new();
        load(&warehouse, "o1", vec![event(1, "k1", Operation::Insert, "A", ts(1))]).await;

        let err = engine(&warehouse, 100)
            .merge_window("customer", 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OffsetGap);
        assert_eq!(warehouse.merge_watermark("customer").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn merges_until_caught_up() {
        let warehouse = MemoryWarehouse::new();
        let events = (1..=7)
            .map(|offset| {
                event(
                    offset,
                    &format!("k{offset}"),
                    Operation::Insert,
                    "A",
                    ts(offset as i64),
                )
            })
            .collect();
        load(&warehouse, "o1", events).await;

        let summary = engine(&warehouse, 3)
            .merge_until_caught_up("customer")
            .await
            .unwrap();

        assert_eq!(summary.windows, 3);
        assert_eq!(summary.raw_records, 7);
        assert_eq!(summary.watermark, 7);
        assert_eq!(warehouse.merge_watermark("customer").await.unwrap(), 7);
    }
}
