use std::collections::BTreeSet;
use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::EtlResult;
use crate::types::{
    ChangeEvent, ConformedRecord, DimensionChange, DimensionVersion, FactRecord,
    QuarantinedRecord, RawRecord, Watermark,
};

/// Result of loading one staged object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The object was recorded as loaded in this call.
    Loaded {
        /// Raw records inserted.
        raw_records: usize,
        /// Events skipped because a raw record with the same partition and offset already
        /// existed (an overlapping staged object loaded earlier).
        duplicates: usize,
        /// Events set aside in quarantine.
        quarantined: usize,
    },
    /// The object was already in the loaded set. Nothing was written. This is how a duplicate
    /// commit of an object surfaces, and callers treat it as a no-op.
    AlreadyLoaded,
}

/// Append-only raw records and the loaded set.
pub trait RawStore {
    /// Returns the names of every staged object already loaded.
    fn loaded_object_names(&self) -> impl Future<Output = EtlResult<BTreeSet<String>>> + Send;

    /// Atomically inserts `events` as raw records, stores `quarantined` and records
    /// `object_name` as loaded.
    ///
    /// Raw records get the next gapless load sequences of their entity, in the order given.
    /// If the object is already loaded nothing is written and [`LoadOutcome::AlreadyLoaded`] is
    /// returned.
    fn load_staged_object(
        &self,
        object_name: &str,
        events: Vec<ChangeEvent>,
        quarantined: Vec<QuarantinedRecord>,
    ) -> impl Future<Output = EtlResult<LoadOutcome>> + Send;

    /// Returns up to `limit` raw records of `entity` with a load sequence greater than
    /// `after`, ordered by load sequence.
    fn read_raw_records(
        &self,
        entity: &str,
        after: Watermark,
        limit: usize,
    ) -> impl Future<Output = EtlResult<Vec<RawRecord>>> + Send;
}

/// Current state records and merge watermarks.
pub trait ConformedStore {
    /// Returns the highest load sequence merged for `entity`, zero if none.
    fn merge_watermark(&self, entity: &str) -> impl Future<Output = EtlResult<Watermark>> + Send;

    /// Returns the stored records of `entity` for the given business keys.
    fn conformed_records_for(
        &self,
        entity: &str,
        business_keys: &[String],
    ) -> impl Future<Output = EtlResult<Vec<ConformedRecord>>> + Send;

    /// Returns every record of `entity`, ordered by business key.
    fn conformed_records(
        &self,
        entity: &str,
    ) -> impl Future<Output = EtlResult<Vec<ConformedRecord>>> + Send;

    /// Atomically upserts `records` by business key and raises the watermark of `entity` to
    /// `watermark`. The stored watermark never decreases.
    fn commit_merge(
        &self,
        entity: &str,
        records: Vec<ConformedRecord>,
        watermark: Watermark,
    ) -> impl Future<Output = EtlResult<()>> + Send;
}

/// Historized dimension versions.
pub trait DimensionStore {
    /// Returns the current version of every business key of `entity`.
    fn current_versions(
        &self,
        entity: &str,
    ) -> impl Future<Output = EtlResult<Vec<DimensionVersion>>> + Send;

    /// Returns the `as_of` of the latest snapshot pass applied to `entity`.
    fn last_snapshot_at(
        &self,
        entity: &str,
    ) -> impl Future<Output = EtlResult<Option<DateTime<Utc>>>> + Send;

    /// Atomically applies `changes` and records `as_of` as the latest snapshot of `entity`.
    ///
    /// Opened versions get new surrogate keys from the store. Changes that do not match the
    /// stored current versions fail the whole pass and nothing is applied.
    fn apply_dimension_changes(
        &self,
        entity: &str,
        as_of: DateTime<Utc>,
        changes: Vec<DimensionChange>,
    ) -> impl Future<Output = EtlResult<Vec<DimensionVersion>>> + Send;

    /// Returns the version of `business_key` whose validity interval contains `at`.
    fn version_at(
        &self,
        entity: &str,
        business_key: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = EtlResult<Option<DimensionVersion>>> + Send;

    /// Returns every version of `entity`, ordered by business key and `valid_from`.
    fn dimension_versions(
        &self,
        entity: &str,
    ) -> impl Future<Output = EtlResult<Vec<DimensionVersion>>> + Send;
}

/// Row counts of a fact upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactUpsertCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Fact tables keyed by natural key.
pub trait FactStore {
    /// Atomically upserts `records` by natural key into `fact_table` and stores `quarantined`.
    fn upsert_facts(
        &self,
        fact_table: &str,
        records: Vec<FactRecord>,
        quarantined: Vec<QuarantinedRecord>,
    ) -> impl Future<Output = EtlResult<FactUpsertCounts>> + Send;

    /// Returns every row of `fact_table`, ordered by natural key.
    fn facts(&self, fact_table: &str) -> impl Future<Output = EtlResult<Vec<FactRecord>>> + Send;
}

/// Read access to quarantined records.
pub trait QuarantineStore {
    /// Returns every quarantined record ordered by stage, scope and record reference.
    fn quarantined_records(
        &self,
    ) -> impl Future<Output = EtlResult<Vec<QuarantinedRecord>>> + Send;
}
