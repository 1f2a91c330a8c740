use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use medallion_postgres::warehouse::{
    bronze, conformed, cursors, dimensions, facts, leases, quarantine,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use crate::bail;
use crate::concurrency::lease::{LeaseScope, LeaseStore};
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::store::cursor::CursorStore;
use crate::store::warehouse::{
    ConformedStore, DimensionStore, FactStore, FactUpsertCounts, LoadOutcome, QuarantineStore,
    RawStore,
};
use crate::types::{
    ChangeEvent, ConformedRecord, DimensionChange, DimensionVersion, FactRecord, LoadCursor,
    Operation, PartitionKey, QuarantineReason, QuarantineStage, QuarantinedRecord, RawRecord,
    RecordVersion, SurrogateKey, Watermark,
};

/// Warehouse backed by the Postgres tables of `medallion_postgres`.
///
/// Every trait mutation runs in one transaction, so readers see it entirely or not at all.
#[derive(Debug, Clone)]
pub struct PostgresWarehouse {
    pool: PgPool,
}

impl PostgresWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_i64(value: u64, what: &'static str) -> EtlResult<i64> {
    i64::try_from(value).map_err(|_| {
        etl_error!(
            ErrorKind::InvalidData,
            "Value does not fit the warehouse column",
            format!("{what} {value} is larger than {}", i64::MAX)
        )
    })
}

fn to_u64(value: i64, what: &'static str) -> EtlResult<u64> {
    u64::try_from(value).map_err(|_| {
        etl_error!(
            ErrorKind::InvalidData,
            "Negative value in warehouse column",
            format!("{what} is {value}")
        )
    })
}

fn to_json<T: Serialize>(value: &T) -> EtlResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> EtlResult<T> {
    Ok(serde_json::from_value(value)?)
}

fn parse_operation(value: &str) -> EtlResult<Operation> {
    match value {
        "insert" => Ok(Operation::Insert),
        "update" => Ok(Operation::Update),
        "delete" => Ok(Operation::Delete),
        other => bail!(
            ErrorKind::DeserializationError,
            "Unknown operation in raw record",
            format!("`{other}` is not an operation")
        ),
    }
}

fn raw_record_from_row(row: bronze::RawRecordRow) -> EtlResult<RawRecord> {
    Ok(RawRecord {
        entity: row.entity,
        load_sequence: to_u64(row.load_sequence, "load sequence")?,
        partition_key: PartitionKey::new(row.partition_key)?,
        offset: to_u64(row.source_offset, "offset")?,
        operation: parse_operation(&row.operation)?,
        business_key: row.business_key,
        before: row.before_image.map(from_json).transpose()?,
        after: row.after_image.map(from_json).transpose()?,
        commit_timestamp: row.commit_timestamp,
        source_staged_object: row.source_staged_object,
    })
}

fn conformed_record_from_row(row: conformed::ConformedRecordRow) -> EtlResult<ConformedRecord> {
    Ok(ConformedRecord {
        entity: row.entity,
        business_key: row.business_key,
        attributes: from_json(row.attributes)?,
        version: RecordVersion {
            commit_timestamp: row.version_commit_timestamp,
            offset: to_u64(row.version_offset, "version offset")?,
        },
        active: row.active,
    })
}

fn dimension_version_from_row(row: dimensions::DimensionVersionRow) -> EtlResult<DimensionVersion> {
    Ok(DimensionVersion {
        entity: row.entity,
        business_key: row.business_key,
        surrogate_key: SurrogateKey(row.surrogate_key),
        attributes: from_json(row.attributes)?,
        valid_from: row.valid_from,
        valid_to: row.valid_to,
        is_current: row.is_current,
    })
}

fn fact_row(record: &FactRecord) -> EtlResult<facts::FactRecordRow> {
    Ok(facts::FactRecordRow {
        fact_table: record.fact_table.clone(),
        natural_key: record.natural_key.clone(),
        dimension_keys: to_json(&record.dimension_keys)?,
        measures: to_json(&record.measures)?,
        event_timestamp: record.event_timestamp,
    })
}

fn fact_record_from_row(row: facts::FactRecordRow) -> EtlResult<FactRecord> {
    Ok(FactRecord {
        fact_table: row.fact_table,
        natural_key: row.natural_key,
        dimension_keys: from_json(row.dimension_keys)?,
        measures: from_json(row.measures)?,
        event_timestamp: row.event_timestamp,
    })
}

fn parse_stage(value: &str) -> EtlResult<QuarantineStage> {
    match value {
        "bronze" => Ok(QuarantineStage::Bronze),
        "fact" => Ok(QuarantineStage::Fact),
        other => bail!(
            ErrorKind::DeserializationError,
            "Unknown quarantine stage",
            format!("`{other}` is not a quarantine stage")
        ),
    }
}

fn parse_reason(value: &str) -> EtlResult<QuarantineReason> {
    match value {
        "schema_violation" => Ok(QuarantineReason::SchemaViolation),
        "orphan_reference" => Ok(QuarantineReason::OrphanReference),
        other => bail!(
            ErrorKind::DeserializationError,
            "Unknown quarantine reason",
            format!("`{other}` is not a quarantine reason")
        ),
    }
}

async fn insert_quarantined(
    conn: &mut PgConnection,
    records: &[QuarantinedRecord],
) -> EtlResult<()> {
    for record in records {
        quarantine::insert_quarantined_record(
            &mut *conn,
            record.stage.as_str(),
            &record.scope,
            &record.record_ref,
            record.reason.as_str(),
            &record.detail,
            &record.payload,
        )
        .await?;
    }

    Ok(())
}

async fn close_version(
    conn: &mut PgConnection,
    entity: &str,
    business_key: &str,
    surrogate_key: SurrogateKey,
    valid_to: DateTime<Utc>,
) -> EtlResult<()> {
    if let Some(current) =
        dimensions::get_current_dimension_version(&mut *conn, entity, business_key).await?
    {
        if current.surrogate_key == surrogate_key.0 && valid_to <= current.valid_from {
            bail!(
                ErrorKind::SnapshotOutOfOrder,
                "Version cannot be closed at or before its start",
                format!(
                    "Version {surrogate_key} of `{business_key}` starts at {} and cannot end at {valid_to}",
                    current.valid_from
                )
            );
        }
    }

    let closed = dimensions::close_dimension_version(
        &mut *conn,
        entity,
        business_key,
        surrogate_key.0,
        valid_to,
    )
    .await?;
    if closed.is_none() {
        bail!(
            ErrorKind::InvalidState,
            "Version to close is not current",
            format!("Version {surrogate_key} of `{business_key}` in `{entity}` is not the current version")
        );
    }

    Ok(())
}

impl RawStore for PostgresWarehouse {
    async fn loaded_object_names(&self) -> EtlResult<BTreeSet<String>> {
        let names = bronze::get_loaded_object_names(&self.pool).await?;

        Ok(names.into_iter().collect())
    }

    async fn load_staged_object(
        &self,
        object_name: &str,
        events: Vec<ChangeEvent>,
        quarantined: Vec<QuarantinedRecord>,
    ) -> EtlResult<LoadOutcome> {
        let mut tx = self.pool.begin().await?;

        if !bronze::mark_object_loaded(&mut *tx, object_name).await? {
            tx.rollback().await?;
            return Ok(LoadOutcome::AlreadyLoaded);
        }

        let mut raw_records = 0;
        let mut duplicates = 0;
        for event in events {
            let offset = to_i64(event.offset, "offset")?;
            if bronze::raw_record_exists(&mut *tx, event.partition_key.as_str(), offset).await? {
                duplicates += 1;
                continue;
            }

            let load_sequence = bronze::next_load_sequence(&mut *tx, &event.entity).await?;
            let row = bronze::RawRecordRow {
                load_sequence,
                partition_key: event.partition_key.to_string(),
                source_offset: offset,
                operation: event.operation.as_str().to_string(),
                before_image: event.before.as_ref().map(to_json).transpose()?,
                after_image: event.after.as_ref().map(to_json).transpose()?,
                commit_timestamp: event.commit_timestamp,
                source_staged_object: object_name.to_string(),
                entity: event.entity,
                business_key: event.business_key,
            };
            bronze::insert_raw_record(&mut *tx, &row).await?;
            raw_records += 1;
        }

        insert_quarantined(&mut tx, &quarantined).await?;
        tx.commit().await?;

        Ok(LoadOutcome::Loaded {
            raw_records,
            duplicates,
            quarantined: quarantined.len(),
        })
    }

    async fn read_raw_records(
        &self,
        entity: &str,
        after: Watermark,
        limit: usize,
    ) -> EtlResult<Vec<RawRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows =
            bronze::get_raw_records_after(&self.pool, entity, to_i64(after, "watermark")?, limit)
                .await?;

        rows.into_iter().map(raw_record_from_row).collect()
    }
}

impl ConformedStore for PostgresWarehouse {
    async fn merge_watermark(&self, entity: &str) -> EtlResult<Watermark> {
        match conformed::get_merge_watermark(&self.pool, entity).await? {
            Some(watermark) => to_u64(watermark, "watermark"),
            None => Ok(0),
        }
    }

    async fn conformed_records_for(
        &self,
        entity: &str,
        business_keys: &[String],
    ) -> EtlResult<Vec<ConformedRecord>> {
        let rows = conformed::get_conformed_records_for(&self.pool, entity, business_keys).await?;

        rows.into_iter().map(conformed_record_from_row).collect()
    }

    async fn conformed_records(&self, entity: &str) -> EtlResult<Vec<ConformedRecord>> {
        let rows = conformed::get_conformed_records(&self.pool, entity).await?;

        rows.into_iter().map(conformed_record_from_row).collect()
    }

    async fn commit_merge(
        &self,
        entity: &str,
        records: Vec<ConformedRecord>,
        watermark: Watermark,
    ) -> EtlResult<()> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            let row = conformed::ConformedRecordRow {
                entity: record.entity,
                business_key: record.business_key,
                attributes: to_json(&record.attributes)?,
                version_commit_timestamp: record.version.commit_timestamp,
                version_offset: to_i64(record.version.offset, "version offset")?,
                active: record.active,
            };
            conformed::upsert_conformed_record(&mut *tx, &row).await?;
        }
        conformed::raise_merge_watermark(&mut *tx, entity, to_i64(watermark, "watermark")?)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}

impl DimensionStore for PostgresWarehouse {
    async fn current_versions(&self, entity: &str) -> EtlResult<Vec<DimensionVersion>> {
        let rows = dimensions::get_current_dimension_versions(&self.pool, entity).await?;

        rows.into_iter().map(dimension_version_from_row).collect()
    }

    async fn last_snapshot_at(&self, entity: &str) -> EtlResult<Option<DateTime<Utc>>> {
        Ok(dimensions::get_snapshot_marker(&self.pool, entity).await?)
    }

    async fn apply_dimension_changes(
        &self,
        entity: &str,
        as_of: DateTime<Utc>,
        changes: Vec<DimensionChange>,
    ) -> EtlResult<Vec<DimensionVersion>> {
        let mut tx = self.pool.begin().await?;

        if let Some(last) = dimensions::lock_snapshot_marker(&mut *tx, entity).await? {
            if as_of < last {
                bail!(
                    ErrorKind::SnapshotOutOfOrder,
                    "Snapshot is older than the last applied snapshot",
                    format!("Entity `{entity}` was snapshotted at {last}, requested {as_of}")
                );
            }
        }

        let mut opened = Vec::new();
        for change in changes {
            let (business_key, attributes, valid_from) = match change {
                DimensionChange::Open {
                    business_key,
                    attributes,
                    valid_from,
                } => (business_key, attributes, valid_from),
                DimensionChange::Close {
                    business_key,
                    surrogate_key,
                    valid_to,
                } => {
                    close_version(&mut tx, entity, &business_key, surrogate_key, valid_to).await?;
                    continue;
                }
                DimensionChange::Replace {
                    business_key,
                    surrogate_key,
                    attributes,
                    at,
                } => {
                    close_version(&mut tx, entity, &business_key, surrogate_key, at).await?;
                    (business_key, attributes, at)
                }
            };

            if dimensions::get_current_dimension_version(&mut *tx, entity, &business_key)
                .await?
                .is_some()
            {
                bail!(
                    ErrorKind::InvalidState,
                    "Business key already has a current version",
                    format!("Cannot open a second current version of `{business_key}` in `{entity}`")
                );
            }

            let row = dimensions::open_dimension_version(
                &mut *tx,
                entity,
                &business_key,
                &to_json(&attributes)?,
                valid_from,
            )
            .await?;
            opened.push(dimension_version_from_row(row)?);
        }

        dimensions::set_snapshot_marker(&mut *tx, entity, as_of).await?;
        tx.commit().await?;

        Ok(opened)
    }

    async fn version_at(
        &self,
        entity: &str,
        business_key: &str,
        at: DateTime<Utc>,
    ) -> EtlResult<Option<DimensionVersion>> {
        dimensions::get_dimension_version_at(&self.pool, entity, business_key, at)
            .await?
            .map(dimension_version_from_row)
            .transpose()
    }

    async fn dimension_versions(&self, entity: &str) -> EtlResult<Vec<DimensionVersion>> {
        let rows = dimensions::get_dimension_versions(&self.pool, entity).await?;

        rows.into_iter().map(dimension_version_from_row).collect()
    }
}

impl FactStore for PostgresWarehouse {
    async fn upsert_facts(
        &self,
        fact_table: &str,
        records: Vec<FactRecord>,
        quarantined: Vec<QuarantinedRecord>,
    ) -> EtlResult<FactUpsertCounts> {
        let mut tx = self.pool.begin().await?;

        let mut counts = FactUpsertCounts::default();
        for record in &records {
            let row = fact_row(record)?;
            match facts::lock_fact_record(&mut *tx, fact_table, &record.natural_key).await? {
                Some(existing) if existing == row => {
                    counts.unchanged += 1;
                    continue;
                }
                Some(_) => counts.updated += 1,
                None => counts.inserted += 1,
            }
            facts::upsert_fact_record(&mut *tx, &row).await?;
        }

        insert_quarantined(&mut tx, &quarantined).await?;
        tx.commit().await?;

        Ok(counts)
    }

    async fn facts(&self, fact_table: &str) -> EtlResult<Vec<FactRecord>> {
        let rows = facts::get_fact_records(&self.pool, fact_table).await?;

        rows.into_iter().map(fact_record_from_row).collect()
    }
}

impl QuarantineStore for PostgresWarehouse {
    async fn quarantined_records(&self) -> EtlResult<Vec<QuarantinedRecord>> {
        let rows = quarantine::get_quarantined_records(&self.pool).await?;

        rows.into_iter()
            .map(|row| {
                Ok(QuarantinedRecord {
                    stage: parse_stage(&row.stage)?,
                    scope: row.scope,
                    record_ref: row.record_ref,
                    reason: parse_reason(&row.reason)?,
                    detail: row.detail,
                    payload: row.payload,
                    quarantined_at: Some(row.quarantined_at),
                })
            })
            .collect()
    }
}

/// Cursor store backed by the `load_cursors` table.
#[derive(Debug, Clone)]
pub struct PostgresCursorStore {
    pool: PgPool,
}

impl PostgresCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CursorStore for PostgresCursorStore {
    async fn load_cursor(&self, partition_key: &PartitionKey) -> EtlResult<Option<LoadCursor>> {
        let Some(row) = cursors::get_load_cursor(&self.pool, partition_key.as_str()).await? else {
            return Ok(None);
        };

        Ok(Some(LoadCursor {
            partition_key: PartitionKey::new(row.partition_key)?,
            last_committed_offset: to_u64(row.last_committed_offset, "cursor offset")?,
        }))
    }

    async fn commit_cursor(&self, cursor: LoadCursor) -> EtlResult<()> {
        let offset = to_i64(cursor.last_committed_offset, "cursor offset")?;
        let stored =
            cursors::advance_load_cursor(&self.pool, cursor.partition_key.as_str(), offset).await?;

        if stored > offset {
            bail!(
                ErrorKind::InvalidState,
                "Load cursor cannot move backwards",
                format!(
                    "Partition `{}` is committed at offset {stored} but offset {offset} was requested",
                    cursor.partition_key
                )
            );
        }

        debug!(partition = %cursor.partition_key, offset, "committed cursor row");

        Ok(())
    }
}

/// Lease store backed by the `leases` table. Excludes holders across processes sharing the
/// warehouse database.
#[derive(Debug, Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
}

impl PostgresLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl LeaseStore for PostgresLeaseStore {
    async fn try_acquire(
        &self,
        scope: &LeaseScope,
        holder: &str,
        ttl: Duration,
    ) -> EtlResult<bool> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        Ok(leases::try_acquire_lease(
            &self.pool,
            scope.stage.as_str(),
            &scope.key,
            holder,
            ttl_ms,
        )
        .await?)
    }

    async fn release(&self, scope: &LeaseScope, holder: &str) -> EtlResult<()> {
        leases::release_lease(&self.pool, scope.stage.as_str(), &scope.key, holder).await?;

        Ok(())
    }
}

