use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::bail;
use crate::concurrency::lease::{LeaseScope, LeaseStore};
use crate::error::{ErrorKind, EtlResult};
use crate::store::cursor::{CursorStore, check_cursor_advance};
use crate::store::warehouse::{
    ConformedStore, DimensionStore, FactStore, FactUpsertCounts, LoadOutcome, QuarantineStore,
    RawStore,
};
use crate::types::{
    ChangeEvent, ConformedRecord, DimensionChange, DimensionVersion, FactRecord, LoadCursor,
    Offset, PartitionKey, QuarantinedRecord, RawRecord, SurrogateKey, Watermark,
};

/// Inner state of [`MemoryWarehouse`].
#[derive(Debug, Default)]
struct Inner {
    loaded_objects: BTreeSet<String>,
    /// Raw records per entity. The record at index `i` has load sequence `i + 1`.
    raw_records: HashMap<String, Vec<RawRecord>>,
    raw_positions: HashSet<(PartitionKey, Offset)>,
    merge_watermarks: HashMap<String, Watermark>,
    conformed_records: HashMap<String, BTreeMap<String, ConformedRecord>>,
    /// Dimension versions per entity in insertion order.
    dimension_versions: HashMap<String, Vec<DimensionVersion>>,
    snapshot_markers: HashMap<String, DateTime<Utc>>,
    last_surrogate_key: i64,
    facts: HashMap<String, BTreeMap<String, FactRecord>>,
    quarantine: BTreeMap<(&'static str, String, String), QuarantinedRecord>,
}

impl Inner {
    fn insert_quarantined(&mut self, records: Vec<QuarantinedRecord>) {
        let now = Utc::now();
        for mut record in records {
            let key = (
                record.stage.as_str(),
                record.scope.clone(),
                record.record_ref.clone(),
            );
            self.quarantine.entry(key).or_insert_with(|| {
                record.quarantined_at = Some(now);
                record
            });
        }
    }
}

/// In-memory warehouse implementing every warehouse store trait.
///
/// Each mutation runs under a single lock, which gives it the same all-or-nothing visibility a
/// database transaction gives the Postgres warehouse. Data is lost when the process exits, so
/// this is meant for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every raw record of `entity` in load order.
    pub async fn raw_records(&self, entity: &str) -> Vec<RawRecord> {
        let inner = self.inner.lock().await;

        inner.raw_records.get(entity).cloned().unwrap_or_default()
    }
}

impl RawStore for MemoryWarehouse {
    async fn loaded_object_names(&self) -> EtlResult<BTreeSet<String>> {
        let inner = self.inner.lock().await;

        Ok(inner.loaded_objects.clone())
    }

    async fn load_staged_object(
        &self,
        object_name: &str,
        events: Vec<ChangeEvent>,
        quarantined: Vec<QuarantinedRecord>,
    ) -> EtlResult<LoadOutcome> {
        let mut inner = self.inner.lock().await;

        if inner.loaded_objects.contains(object_name) {
            return Ok(LoadOutcome::AlreadyLoaded);
        }

        let mut raw_records = 0;
        let mut duplicates = 0;
        for event in events {
            let position = (event.partition_key.clone(), event.offset);
            if !inner.raw_positions.insert(position) {
                duplicates += 1;
                continue;
            }

            let entity_records = inner.raw_records.entry(event.entity.clone()).or_default();
            let load_sequence = entity_records.len() as u64 + 1;
            entity_records.push(RawRecord::from_event(event, load_sequence, object_name));
            raw_records += 1;
        }

        let quarantined_count = quarantined.len();
        inner.insert_quarantined(quarantined);
        inner.loaded_objects.insert(object_name.to_string());

        Ok(LoadOutcome::Loaded {
            raw_records,
            duplicates,
            quarantined: quarantined_count,
        })
    }

    async fn read_raw_records(
        &self,
        entity: &str,
        after: Watermark,
        limit: usize,
    ) -> EtlResult<Vec<RawRecord>> {
        let inner = self.inner.lock().await;

        let records = inner
            .raw_records
            .get(entity)
            .map(|records| {
                records
                    .iter()
                    .skip(after as usize)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(records)
    }
}

impl ConformedStore for MemoryWarehouse {
    async fn merge_watermark(&self, entity: &str) -> EtlResult<Watermark> {
        let inner = self.inner.lock().await;

        Ok(inner.merge_watermarks.get(entity).copied().unwrap_or(0))
    }

    async fn conformed_records_for(
        &self,
        entity: &str,
        business_keys: &[String],
    ) -> EtlResult<Vec<ConformedRecord>> {
        let inner = self.inner.lock().await;

        let Some(records) = inner.conformed_records.get(entity) else {
            return Ok(vec![]);
        };

        Ok(business_keys
            .iter()
            .filter_map(|key| records.get(key).cloned())
            .collect())
    }

    async fn conformed_records(&self, entity: &str) -> EtlResult<Vec<ConformedRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .conformed_records
            .get(entity)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit_merge(
        &self,
        entity: &str,
        records: Vec<ConformedRecord>,
        watermark: Watermark,
    ) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;

        let entity_records = inner.conformed_records.entry(entity.to_string()).or_default();
        for record in records {
            entity_records.insert(record.business_key.clone(), record);
        }

        let stored = inner.merge_watermarks.entry(entity.to_string()).or_insert(0);
        *stored = (*stored).max(watermark);

        Ok(())
    }
}

impl DimensionStore for MemoryWarehouse {
    async fn current_versions(&self, entity: &str) -> EtlResult<Vec<DimensionVersion>> {
        let inner = self.inner.lock().await;

        let mut versions: Vec<DimensionVersion> = inner
            .dimension_versions
            .get(entity)
            .map(|versions| versions.iter().filter(|v| v.is_current).cloned().collect())
            .unwrap_or_default();
        versions.sort_by(|a, b| a.business_key.cmp(&b.business_key));

        Ok(versions)
    }

    async fn last_snapshot_at(&self, entity: &str) -> EtlResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().await;

        Ok(inner.snapshot_markers.get(entity).copied())
    }

    async fn apply_dimension_changes(
        &self,
        entity: &str,
        as_of: DateTime<Utc>,
        changes: Vec<DimensionChange>,
    ) -> EtlResult<Vec<DimensionVersion>> {
        let mut inner = self.inner.lock().await;

        if let Some(last) = inner.snapshot_markers.get(entity) {
            if as_of < *last {
                bail!(
                    ErrorKind::SnapshotOutOfOrder,
                    "Snapshot is older than the last applied snapshot",
                    format!("Entity `{entity}` was snapshotted at {last}, requested {as_of}")
                );
            }
        }

        // Changes are applied to a copy so a failing change leaves the stored versions untouched.
        let mut versions = inner
            .dimension_versions
            .get(entity)
            .cloned()
            .unwrap_or_default();
        let mut last_surrogate_key = inner.last_surrogate_key;
        let mut opened = Vec::new();

        for change in changes {
            match change {
                DimensionChange::Open {
                    business_key,
                    attributes,
                    valid_from,
                } => {
                    if versions
                        .iter()
                        .any(|v| v.is_current && v.business_key == business_key)
                    {
                        bail!(
                            ErrorKind::InvalidState,
                            "Business key already has a current version",
                            format!("Cannot open a second current version of `{business_key}` in `{entity}`")
                        );
                    }

                    last_surrogate_key += 1;
                    let version = DimensionVersion {
                        entity: entity.to_string(),
                        business_key,
                        surrogate_key: SurrogateKey(last_surrogate_key),
                        attributes,
                        valid_from,
                        valid_to: None,
                        is_current: true,
                    };
                    opened.push(version.clone());
                    versions.push(version);
                }
                DimensionChange::Close {
                    business_key,
                    surrogate_key,
                    valid_to,
                } => {
                    close_version(entity, &mut versions, &business_key, surrogate_key, valid_to)?;
                }
                DimensionChange::Replace {
                    business_key,
                    surrogate_key,
                    attributes,
                    at,
                } => {
                    close_version(entity, &mut versions, &business_key, surrogate_key, at)?;

                    last_surrogate_key += 1;
                    let version = DimensionVersion {
                        entity: entity.to_string(),
                        business_key,
                        surrogate_key: SurrogateKey(last_surrogate_key),
                        attributes,
                        valid_from: at,
                        valid_to: None,
                        is_current: true,
                    };
                    opened.push(version.clone());
                    versions.push(version);
                }
            }
        }

        inner.dimension_versions.insert(entity.to_string(), versions);
        inner.last_surrogate_key = last_surrogate_key;
        inner.snapshot_markers.insert(entity.to_string(), as_of);

        Ok(opened)
    }

    async fn version_at(
        &self,
        entity: &str,
        business_key: &str,
        at: DateTime<Utc>,
    ) -> EtlResult<Option<DimensionVersion>> {
        let inner = self.inner.lock().await;

        Ok(inner.dimension_versions.get(entity).and_then(|versions| {
            versions
                .iter()
                .find(|v| v.business_key == business_key && v.contains(at))
                .cloned()
        }))
    }

    async fn dimension_versions(&self, entity: &str) -> EtlResult<Vec<DimensionVersion>> {
        let inner = self.inner.lock().await;

        let mut versions = inner
            .dimension_versions
            .get(entity)
            .cloned()
            .unwrap_or_default();
        versions.sort_by(|a, b| {
            a.business_key
                .cmp(&b.business_key)
                .then(a.valid_from.cmp(&b.valid_from))
        });

        Ok(versions)
    }
}

fn close_version(
    entity: &str,
    versions: &mut [DimensionVersion],
    business_key: &str,
    surrogate_key: SurrogateKey,
    valid_to: DateTime<Utc>,
) -> EtlResult<()> {
    let Some(version) = versions
        .iter_mut()
        .find(|v| {
            v.is_current && v.surrogate_key == surrogate_key && v.business_key == business_key
        })
    else {
        bail!(
            ErrorKind::InvalidState,
            "Version to close is not current",
            format!("Version {surrogate_key} of `{business_key}` in `{entity}` is not the current version")
        );
    };

    if valid_to <= version.valid_from {
        bail!(
            ErrorKind::SnapshotOutOfOrder,
            "Version cannot be closed at or before its start",
            format!(
                "Version {surrogate_key} of `{business_key}` starts at {} and cannot end at {valid_to}",
                version.valid_from
            )
        );
    }

    version.valid_to = Some(valid_to);
    version.is_current = false;

    Ok(())
}

impl FactStore for MemoryWarehouse {
    async fn upsert_facts(
        &self,
        fact_table: &str,
        records: Vec<FactRecord>,
        quarantined: Vec<QuarantinedRecord>,
    ) -> EtlResult<FactUpsertCounts> {
        let mut inner = self.inner.lock().await;

        let mut counts = FactUpsertCounts::default();
        let table = inner.facts.entry(fact_table.to_string()).or_default();
        for record in records {
            match table.get(&record.natural_key) {
                Some(existing) if *existing == record => counts.unchanged += 1,
                Some(_) => counts.updated += 1,
                None => counts.inserted += 1,
            }
            table.insert(record.natural_key.clone(), record);
        }

        inner.insert_quarantined(quarantined);

        Ok(counts)
    }

    async fn facts(&self, fact_table: &str) -> EtlResult<Vec<FactRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .facts
            .get(fact_table)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }
}

impl QuarantineStore for MemoryWarehouse {
    async fn quarantined_records(&self) -> EtlResult<Vec<QuarantinedRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner.quarantine.values().cloned().collect())
    }
}

/// In-memory cursor store.
#[derive(Debug, Clone, Default)]
pub struct MemoryCursorStore {
    cursors: Arc<Mutex<HashMap<PartitionKey, LoadCursor>>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for MemoryCursorStore {
    async fn load_cursor(&self, partition_key: &PartitionKey) -> EtlResult<Option<LoadCursor>> {
        let cursors = self.cursors.lock().await;

        Ok(cursors.get(partition_key).cloned())
    }

    async fn commit_cursor(&self, cursor: LoadCursor) -> EtlResult<()> {
        let mut cursors = self.cursors.lock().await;

        if check_cursor_advance(cursors.get(&cursor.partition_key), &cursor)? {
            cursors.insert(cursor.partition_key.clone(), cursor);
        }

        Ok(())
    }
}

#[derive(Debug)]
struct LeaseEntry {
    holder: String,
    expires_at: Instant,
}

/// In-process lease store. Leases only exclude holders within the same process.
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseStore {
    leases: Arc<std::sync::Mutex<HashMap<LeaseScope, LeaseEntry>>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> EtlResult<std::sync::MutexGuard<'_, HashMap<LeaseScope, LeaseEntry>>> {
        self.leases.lock().map_err(|_| {
            crate::etl_error!(ErrorKind::InvalidState, "Lease store lock poisoned")
        })
    }
}

impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        scope: &LeaseScope,
        holder: &str,
        ttl: Duration,
    ) -> EtlResult<bool> {
        let mut leases = self.lock()?;
        let now = Instant::now();

        if let Some(entry) = leases.get(scope) {
            if entry.holder != holder && entry.expires_at > now {
                return Ok(false);
            }
        }

        leases.insert(
            scope.clone(),
            LeaseEntry {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );

        Ok(true)
    }

    async fn release(&self, scope: &LeaseScope, holder: &str) -> EtlResult<()> {
        let mut leases = self.lock()?;

        if leases.get(scope).is_some_and(|entry| entry.holder == holder) {
            leases.remove(scope);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::types::{Cell, Operation, RowImage};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn event(partition: &str, offset: Offset, entity: &str, key: &str) -> ChangeEvent {
        ChangeEvent {
            partition_key: PartitionKey::new(partition).unwrap(),
            offset,
            entity: entity.to_string(),
            operation: Operation::Insert,
            business_key: key.to_string(),
            before: None,
            after: Some(RowImage::new(1).with_field("name", key)),
            commit_timestamp: ts(offset as i64),
        }
    }

    fn attributes(tier: &str) -> BTreeMap<String, Cell> {
        BTreeMap::from([("tier".to_string(), Cell::from(tier))])
    }

    #[tokio::test]
    async fn load_assigns_gapless_sequences_per_entity() {
        let warehouse = MemoryWarehouse::new();

        let outcome = warehouse
            .load_staged_object(
                "a",
                vec![
                    event("p0", 1, "customer", "k1"),
                    event("p0", 2, "order", "o1"),
                    event("p0", 3, "customer", "k2"),
                ],
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            LoadOutcome::Loaded {
                raw_records: 3,
                duplicates: 0,
                quarantined: 0
            }
        );

        let customers = warehouse.read_raw_records("customer", 0, 10).await.unwrap();
        let sequences: Vec<u64> = customers.iter().map(|r| r.load_sequence).collect();
        assert_eq!(sequences, vec![1, 2]);

        let after_first = warehouse.read_raw_records("customer", 1, 10).await.unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].business_key, "k2");
    }

    #[tokio::test]
    async fn loading_an_object_twice_is_a_no_op() {
        let warehouse = MemoryWarehouse::new();
        let events = vec![event("p0", 1, "customer", "k1")];

        warehouse
            .load_staged_object("a", events.clone(), vec![])
            .await
            .unwrap();
        let outcome = warehouse.load_staged_object("a", events, vec![]).await.unwrap();

        assert_eq!(outcome, LoadOutcome::AlreadyLoaded);
        assert_eq!(warehouse.raw_records("customer").await.len(), 1);
    }

    #[tokio::test]
    async fn overlapping_objects_do_not_duplicate_raw_records() {
        let warehouse = MemoryWarehouse::new();

        warehouse
            .load_staged_object(
                "a",
                vec![event("p0", 1, "customer", "k1"), event("p0", 2, "customer", "k2")],
                vec![],
            )
            .await
            .unwrap();
        let outcome = warehouse
            .load_staged_object(
                "b",
                vec![event("p0", 2, "customer", "k2"), event("p0", 3, "customer", "k3")],
                vec![],
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            LoadOutcome::Loaded {
                raw_records: 1,
                duplicates: 1,
                quarantined: 0
            }
        );
        assert_eq!(warehouse.raw_records("customer").await.len(), 3);
    }

    #[tokio::test]
    async fn merge_watermark_never_decreases() {
        let warehouse = MemoryWarehouse::new();

        warehouse.commit_merge("customer", vec![], 5).await.unwrap();
        warehouse.commit_merge("customer", vec![], 3).await.unwrap();

        assert_eq!(warehouse.merge_watermark("customer").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn failing_change_leaves_versions_untouched() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .apply_dimension_changes(
                "customer",
                ts(10),
                vec![DimensionChange::Open {
                    business_key: "k1".to_string(),
                    attributes: attributes("A"),
                    valid_from: ts(10),
                }],
            )
            .await
            .unwrap();

        let err = warehouse
            .apply_dimension_changes(
                "customer",
                ts(20),
                vec![
                    DimensionChange::Open {
                        business_key: "k2".to_string(),
                        attributes: attributes("A"),
                        valid_from: ts(20),
                    },
                    DimensionChange::Close {
                        business_key: "k1".to_string(),
                        surrogate_key: SurrogateKey(99),
                        valid_to: ts(20),
                    },
                ],
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(warehouse.dimension_versions("customer").await.unwrap().len(), 1);
        assert_eq!(
            warehouse.last_snapshot_at("customer").await.unwrap(),
            Some(ts(10))
        );
    }

    #[tokio::test]
    async fn replace_closes_and_opens_at_the_same_instant() {
        let warehouse = MemoryWarehouse::new();
        let opened = warehouse
            .apply_dimension_changes(
                "customer",
                ts(10),
                vec![DimensionChange::Open {
                    business_key: "k1".to_string(),
                    attributes: attributes("A"),
                    valid_from: ts(10),
                }],
            )
            .await
            .unwrap();
        let first = opened[0].surrogate_key;

        let replaced = warehouse
            .apply_dimension_changes(
                "customer",
                ts(20),
                vec![DimensionChange::Replace {
                    business_key: "k1".to_string(),
                    surrogate_key: first,
                    attributes: attributes("B"),
                    at: ts(20),
                }],
            )
            .await
            .unwrap();
        assert_ne!(replaced[0].surrogate_key, first);

        let at_15 = warehouse.version_at("customer", "k1", ts(15)).await.unwrap().unwrap();
        assert_eq!(at_15.surrogate_key, first);
        let at_20 = warehouse.version_at("customer", "k1", ts(20)).await.unwrap().unwrap();
        assert_eq!(at_20.surrogate_key, replaced[0].surrogate_key);
        assert!(warehouse.version_at("customer", "k1", ts(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fact_upsert_counts_changes() {
        let warehouse = MemoryWarehouse::new();
        let record = FactRecord {
            fact_table: "sales".to_string(),
            natural_key: "s1".to_string(),
            dimension_keys: BTreeMap::new(),
            measures: BTreeMap::from([("amount".to_string(), Cell::Integer(10))]),
            event_timestamp: ts(1),
        };

        let first = warehouse
            .upsert_facts("sales", vec![record.clone()], vec![])
            .await
            .unwrap();
        let replay = warehouse
            .upsert_facts("sales", vec![record.clone()], vec![])
            .await
            .unwrap();
        let mut changed = record;
        changed.measures.insert("amount".to_string(), Cell::Integer(20));
        let update = warehouse.upsert_facts("sales", vec![changed], vec![]).await.unwrap();

        assert_eq!(first.inserted, 1);
        assert_eq!(replay.unchanged, 1);
        assert_eq!(update.updated, 1);
        assert_eq!(warehouse.facts("sales").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cursor_cannot_move_backwards() {
        let store = MemoryCursorStore::new();
        let partition = PartitionKey::new("p0").unwrap();
        let cursor = |offset| LoadCursor {
            partition_key: partition.clone(),
            last_committed_offset: offset,
        };

        store.commit_cursor(cursor(10)).await.unwrap();
        store.commit_cursor(cursor(10)).await.unwrap();
        let err = store.commit_cursor(cursor(5)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(
            store.load_cursor(&partition).await.unwrap(),
            Some(cursor(10))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_leases_can_be_taken_over() {
        let store = MemoryLeaseStore::new();
        let scope = LeaseScope::new(crate::concurrency::lease::LeaseStage::Merge, "customer");

        assert!(store.try_acquire(&scope, "a", Duration::from_secs(1)).await.unwrap());
        assert!(!store.try_acquire(&scope, "b", Duration::from_secs(1)).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(store.try_acquire(&scope, "b", Duration::from_secs(1)).await.unwrap());
        store.release(&scope, "a").await.unwrap();
        assert!(!store.try_acquire(&scope, "a", Duration::from_secs(1)).await.unwrap());
    }
}
