//! SCD type-2 snapshots of conformed records into dimension versions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use medallion_config::shared::PipelineConfig;
use tracing::{debug, info};

use crate::bail;
use crate::concurrency::lease::{LeaseGuard, LeaseManager, LeaseScope, LeaseStage, LeaseStore};
use crate::concurrency::retry::Retrier;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, EtlResult};
use crate::failpoints::{SNAPSHOT__BEFORE_APPLY, etl_fail_point};
use crate::metrics::{
    ENTITY_LABEL, MEDALLION_DIMENSION_VERSIONS_CLOSED_TOTAL,
    MEDALLION_DIMENSION_VERSIONS_OPENED_TOTAL,
};
use crate::store::warehouse::{ConformedStore, DimensionStore};
use crate::types::{Cell, ConformedRecord, DimensionChange, DimensionVersion};

/// Summary of a snapshot pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSummary {
    /// Versions opened, including the replacements of changed versions.
    pub opened: usize,
    /// Versions closed, either replaced or soft-deleted.
    pub closed: usize,
    /// Keys whose tracked attributes did not change.
    pub unchanged: usize,
}

/// Historizes the conformed records of an entity.
#[derive(Debug)]
pub struct SnapshotEngine<W, L> {
    warehouse: W,
    leases: LeaseManager<L>,
    retrier: Retrier,
    config: Arc<PipelineConfig>,
}

impl<W, L> SnapshotEngine<W, L>
where
    W: ConformedStore + DimensionStore + Clone + Send + Sync + 'static,
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
            shutdown_rx,
        );

        Self {
            warehouse,
            leases,
            retrier,
            config,
        }
    }

    /// Brings the dimension versions of `entity` in line with its conformed records as of
    /// `as_of`.
    ///
    /// Runs under the entity's snapshot lease, and every change of the pass is applied in one
    /// atomic step. Running the same pass twice opens no additional versions.
    pub async fn snapshot(&self, entity: &str, as_of: DateTime<Utc>) -> EtlResult<SnapshotSummary> {
        let lease = self
            .leases
            .acquire(LeaseScope::new(LeaseStage::Snapshot, entity))
            .await?;

        let result = self.snapshot_locked(entity, as_of, &lease).await;
        lease.release().await?;

        result
    }

    async fn snapshot_locked(
        &self,
        entity: &str,
        as_of: DateTime<Utc>,
        lease: &LeaseGuard<L>,
    ) -> EtlResult<SnapshotSummary> {
        let last_snapshot = self
            .retrier
            .run("load_snapshot_marker", || self.warehouse.last_snapshot_at(entity))
            .await?;
        if let Some(last) = last_snapshot {
            if as_of < last {
                bail!(
                    ErrorKind::SnapshotOutOfOrder,
                    "Snapshot is older than the last applied snapshot",
                    format!("Entity `{entity}` was snapshotted at {last}, requested {as_of}")
                );
            }
        }

        let records = self
            .retrier
            .run("read_conformed_records", || self.warehouse.conformed_records(entity))
            .await?;
        let current: HashMap<String, DimensionVersion> = self
            .retrier
            .run("read_current_versions", || self.warehouse.current_versions(entity))
            .await?
            .into_iter()
            .map(|version| (version.business_key.clone(), version))
            .collect();

        let tracked = self.config.tracked_attributes(entity);
        let (changes, summary) = plan_changes(entity, as_of, tracked, &records, &current)?;

        lease.renew().await?;
        self.retrier
            .run("apply_dimension_changes", || {
                let changes = changes.clone();
                async move {
                    etl_fail_point(SNAPSHOT__BEFORE_APPLY)?;
                    self.warehouse
                        .apply_dimension_changes(entity, as_of, changes)
                        .await
                }
            })
            .await?;

        metrics::counter!(
            MEDALLION_DIMENSION_VERSIONS_OPENED_TOTAL,
            ENTITY_LABEL => entity.to_string()
        )
        .increment(summary.opened as u64);
        metrics::counter!(
            MEDALLION_DIMENSION_VERSIONS_CLOSED_TOTAL,
            ENTITY_LABEL => entity.to_string()
        )
        .increment(summary.closed as u64);
        info!(
            entity,
            %as_of,
            opened = summary.opened,
            closed = summary.closed,
            unchanged = summary.unchanged,
            "snapshot applied"
        );

        Ok(summary)
    }
}

/// Diffs conformed records against the current versions.
///
/// `tracked` limits change detection to the named attributes; when it is empty every attribute
/// is tracked.
fn plan_changes(
    entity: &str,
    as_of: DateTime<Utc>,
    tracked: &[String],
    records: &[ConformedRecord],
    current: &HashMap<String, DimensionVersion>,
) -> EtlResult<(Vec<DimensionChange>, SnapshotSummary)> {
    let mut changes = Vec::new();
    let mut summary = SnapshotSummary::default();

    for record in records {
        let version = current.get(&record.business_key);

        match (record.active, version) {
            (true, None) => {
                changes.push(DimensionChange::Open {
                    business_key: record.business_key.clone(),
                    attributes: record.attributes.clone(),
                    valid_from: as_of,
                });
                summary.opened += 1;
            }
            (true, Some(version)) => {
                if tracked_attributes_equal(tracked, &version.attributes, &record.attributes) {
                    summary.unchanged += 1;
                    continue;
                }

                check_closable(entity, version, as_of)?;
                changes.push(DimensionChange::Replace {
                    business_key: record.business_key.clone(),
                    surrogate_key: version.surrogate_key,
                    attributes: record.attributes.clone(),
                    at: as_of,
                });
                summary.closed += 1;
                summary.opened += 1;
            }
            (false, Some(version)) => {
                check_closable(entity, version, as_of)?;
                changes.push(DimensionChange::Close {
                    business_key: record.business_key.clone(),
                    surrogate_key: version.surrogate_key,
                    valid_to: as_of,
                });
                summary.closed += 1;
            }
            (false, None) => {}
        }
    }

    debug!(entity, changes = changes.len(), "planned dimension changes");

    Ok((changes, summary))
}

fn check_closable(entity: &str, version: &DimensionVersion, as_of: DateTime<Utc>) -> EtlResult<()> {
    if as_of <= version.valid_from {
        bail!(
            ErrorKind::SnapshotOutOfOrder,
            "Version cannot be closed at or before its start",
            format!(
                "Version {} of `{}` in `{entity}` starts at {} and cannot end at {as_of}",
                version.surrogate_key, version.business_key, version.valid_from
            )
        );
    }

    Ok(())
}

fn tracked_attributes_equal(
    tracked: &[String],
    stored: &BTreeMap<String, Cell>,
    incoming: &BTreeMap<String, Cell>,
) -> bool {
    if tracked.is_empty() {
        return stored == incoming;
    }

    tracked
        .iter()
        .all(|attribute| stored.get(attribute) == incoming.get(attribute))
}
