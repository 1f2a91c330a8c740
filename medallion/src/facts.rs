//! Fact merge with point-in-time dimension resolution.

use std::collections::BTreeMap;
use std::sync::Arc;

use medallion_config::shared::PipelineConfig;
use tracing::{info, warn};

use crate::concurrency::lease::{LeaseManager, LeaseScope, LeaseStage, LeaseStore};
use crate::concurrency::retry::Retrier;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::EtlResult;
use crate::metrics::{
    FACT_TABLE_LABEL, MEDALLION_FACTS_UPSERTED_TOTAL, MEDALLION_RECORDS_QUARANTINED_TOTAL,
    REASON_LABEL, STAGE_LABEL,
};
use crate::store::warehouse::{DimensionStore, FactStore};
use crate::types::{
    DimensionReference, FactRecord, FactSource, QuarantineReason, QuarantineStage,
    QuarantinedRecord, SurrogateKey,
};

/// Summary of a [`FactMergeEngine::merge_facts`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FactMergeSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Source records with an unresolved required reference.
    pub quarantined: usize,
}

/// Upserts fact records keyed by natural key.
///
/// Each dimension reference resolves to the version that was valid at the fact's own event
/// time, so late or replayed facts keep their historical associations.
#[derive(Debug)]
pub struct FactMergeEngine<W, L> {
    warehouse: W,
    leases: LeaseManager<L>,
    retrier: Retrier,
}

impl<W, L> FactMergeEngine<W, L>
where
    W: DimensionStore + FactStore + Clone + Send + Sync + 'static,
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
        }
    }

    /// Resolves and upserts `sources` into `fact_table`.
    ///
    /// Sources sharing a natural key collapse to the last one. Sources whose required
    /// references have no version at their event time are quarantined instead of upserted.
    pub async fn merge_facts(
        &self,
        fact_table: &str,
        sources: Vec<FactSource>,
    ) -> EtlResult<FactMergeSummary> {
        let lease = self
            .leases
            .acquire(LeaseScope::new(LeaseStage::Fact, fact_table))
            .await?;

        let result = self.merge_facts_locked(fact_table, sources).await;
        lease.release().await?;

        result
    }

    async fn merge_facts_locked(
        &self,
        fact_table: &str,
        sources: Vec<FactSource>,
    ) -> EtlResult<FactMergeSummary> {
        let mut latest: BTreeMap<String, FactSource> = BTreeMap::new();
        for source in sources {
            latest.insert(source.natural_key.clone(), source);
        }

        let mut records = Vec::with_capacity(latest.len());
        let mut quarantined = Vec::new();
        for source in latest.into_values() {
            match self.resolve(fact_table, &source).await? {
                Ok(dimension_keys) => records.push(FactRecord {
                    fact_table: fact_table.to_string(),
                    natural_key: source.natural_key,
                    dimension_keys,
                    measures: source.measures,
                    event_timestamp: source.event_timestamp,
                }),
                Err(orphan) => quarantined.push(orphan_reference(fact_table, &source, orphan)?),
            }
        }

        let quarantined_count = quarantined.len();
        let counts = self
            .retrier
            .run("upsert_facts", || {
                self.warehouse
                    .upsert_facts(fact_table, records.clone(), quarantined.clone())
            })
            .await?;

        metrics::counter!(
            MEDALLION_FACTS_UPSERTED_TOTAL,
            FACT_TABLE_LABEL => fact_table.to_string()
        )
        .increment((counts.inserted + counts.updated) as u64);
        metrics::counter!(
            MEDALLION_RECORDS_QUARANTINED_TOTAL,
            STAGE_LABEL => QuarantineStage::Fact.as_str(),
            REASON_LABEL => QuarantineReason::OrphanReference.as_str(),
            FACT_TABLE_LABEL => fact_table.to_string()
        )
        .increment(quarantined_count as u64);

        let summary = FactMergeSummary {
            inserted: counts.inserted,
            updated: counts.updated,
            unchanged: counts.unchanged,
            quarantined: quarantined_count,
        };
        info!(
            fact_table,
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            quarantined = summary.quarantined,
            "facts merged"
        );

        Ok(summary)
    }

    /// Resolves every reference of `source`. The inner error is the first required reference
    /// without a version at the event time.
    async fn resolve(
        &self,
        fact_table: &str,
        source: &FactSource,
    ) -> EtlResult<Result<BTreeMap<String, SurrogateKey>, DimensionReference>> {
        let mut dimension_keys = BTreeMap::new();

        for reference in &source.references {
            let version = self
                .retrier
                .run("resolve_dimension_version", || {
                    self.warehouse.version_at(
                        &reference.entity,
                        &reference.business_key,
                        source.event_timestamp,
                    )
                })
                .await?;

            match version {
                Some(version) => {
                    dimension_keys.insert(reference.role.clone(), version.surrogate_key);
                }
                None if reference.required => return Ok(Err(reference.clone())),
                None => {
                    warn!(
                        fact_table,
                        natural_key = %source.natural_key,
                        role = %reference.role,
                        "optional dimension reference is unresolved"
                    );
                }
            }
        }

        Ok(Ok(dimension_keys))
    }
}

fn orphan_reference(
    fact_table: &str,
    source: &FactSource,
    reference: DimensionReference,
) -> EtlResult<QuarantinedRecord> {
    let detail = format!(
        "no version of `{}` key `{}` (role `{}`) is valid at {}",
        reference.entity, reference.business_key, reference.role, source.event_timestamp
    );
    warn!(fact_table, natural_key = %source.natural_key, %detail, "quarantining orphan fact");

    Ok(QuarantinedRecord {
        stage: QuarantineStage::Fact,
        scope: fact_table.to_string(),
        record_ref: source.natural_key.clone(),
        reason: QuarantineReason::OrphanReference,
        detail,
        payload: serde_json::to_value(source)?,
        quarantined_at: None,
    })
}
