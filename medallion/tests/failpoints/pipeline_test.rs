use std::sync::Arc;

use medallion::concurrency::lease::LeaseManager;
use medallion::concurrency::shutdown::create_shutdown_channel;
use medallion::error::ErrorKind;
use medallion::failpoints::{
    BRONZE_LOAD__BEFORE_COMMIT, CONSUMER_FLUSH__AFTER_STAGE_WRITE,
    CONSUMER_FLUSH__BEFORE_STAGE_WRITE, MERGE_WINDOW__BEFORE_COMMIT, SNAPSHOT__BEFORE_APPLY,
};
use medallion::loader::BronzeLoader;
use medallion::merge::MergeEngine;
use medallion::metrics::MEDALLION_RECORDS_QUARANTINED_TOTAL;
use medallion::snapshot::SnapshotEngine;
use medallion::source::memory::MemorySource;
use medallion::staging::StagingStore;
use medallion::staging::memory::MemoryStagingStore;
use medallion::store::cursor::CursorStore;
use medallion::store::memory::{MemoryCursorStore, MemoryLeaseStore, MemoryWarehouse};
use medallion::store::warehouse::{ConformedStore, DimensionStore};
use medallion::test_utils::config::{test_pipeline_config, with_schema};
use medallion::test_utils::event::{EventBuilder, partition, ts};
use medallion::test_utils::failpoints::FailpointScenario;
use medallion::types::{Batch, StagedObjectName};
use medallion::workers::base::{Worker, WorkerHandle};
use medallion::workers::consumer::{ConsumerWorker, ConsumerWorkerHandle};
use medallion_config::shared::PipelineConfig;
use medallion_telemetry::metrics::init_metrics_handle;
use medallion_telemetry::tracing::init_test_tracing;

fn config(max_size: usize) -> Arc<PipelineConfig> {
    let mut config = test_pipeline_config(&["p0"]);
    config.batch.max_size = max_size;
    config.batch.max_fill_ms = 60_000;

    Arc::new(config)
}

async fn start_consumer(
    config: &Arc<PipelineConfig>,
    source: &MemorySource,
    staging: &MemoryStagingStore,
    cursors: &MemoryCursorStore,
    leases: &MemoryLeaseStore,
) -> ConsumerWorkerHandle {
    let (_tx, rx) = create_shutdown_channel();

    ConsumerWorker::new(
        partition("p0"),
        config.clone(),
        source.clone(),
        staging.clone(),
        cursors.clone(),
        LeaseManager::new(leases.clone(), config.lease.clone()),
        rx,
    )
    .start()
    .await
    .unwrap()
}

/// Stages `events` of partition `p0` directly, bypassing the consumer.
async fn stage(staging: &MemoryStagingStore, first: u64, last: u64) {
    let events = EventBuilder::new("p0", "customer");
    let batch = Batch::new(partition("p0"), events.inserts(first, last)).unwrap();
    staging
        .put_if_absent(&batch.staged_name().to_string(), batch.encode().unwrap())
        .await
        .unwrap();
}

fn loader(
    config: &Arc<PipelineConfig>,
    staging: &MemoryStagingStore,
    warehouse: &MemoryWarehouse,
) -> BronzeLoader<MemoryStagingStore, MemoryWarehouse, MemoryLeaseStore> {
    let (_tx, rx) = create_shutdown_channel();

    BronzeLoader::new(
        config.clone(),
        staging.clone(),
        warehouse.clone(),
        LeaseManager::new(MemoryLeaseStore::new(), config.lease.clone()),
        rx,
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_between_stage_write_and_cursor_commit_rolls_forward() {
    init_test_tracing();
    let config = config(3);
    let source = MemorySource::new();
    let staging = MemoryStagingStore::new();
    let cursors = MemoryCursorStore::new();
    let leases = MemoryLeaseStore::new();
    source
        .push(EventBuilder::new("p0", "customer").inserts(1, 3))
        .await;

    let scenario = FailpointScenario::setup(&[(CONSUMER_FLUSH__AFTER_STAGE_WRITE, "1*return")]);
    let handle = start_consumer(&config, &source, &staging, &cursors, &leases).await;
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InjectedFailure);
    assert_eq!(cursors.load_cursor(&partition("p0")).await.unwrap(), None);
    assert_eq!(staging.len().await, 1);
    scenario.teardown();

    let handle = start_consumer(&config, &source, &staging, &cursors, &leases).await;
    let state = handle
        .wait_for_state(|state| state.last_committed_offset == Some(3))
        .await;
    assert_eq!(state.open_events, 0);
    assert_eq!(staging.len().await, 1);
    assert_eq!(
        staging
            .list(&StagedObjectName::partition_prefix(&partition("p0")))
            .await
            .unwrap(),
        vec![StagedObjectName::new(partition("p0"), 1, 3).to_string()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_stage_write_failures_are_retried() {
    init_test_tracing();
    let config = config(2);
    let source = MemorySource::new();
    let staging = MemoryStagingStore::new();
    let cursors = MemoryCursorStore::new();
    let leases = MemoryLeaseStore::new();
    source
        .push(EventBuilder::new("p0", "customer").inserts(1, 2))
        .await;

    let _scenario =
        FailpointScenario::setup(&[(CONSUMER_FLUSH__BEFORE_STAGE_WRITE, "2*return(transient)")]);
    let handle = start_consumer(&config, &source, &staging, &cursors, &leases).await;
    handle
        .wait_for_state(|state| state.last_committed_offset == Some(2))
        .await;

    assert_eq!(staging.len().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_bronze_commit_failure_loads_once() {
    init_test_tracing();
    let config = config(100);
    let staging = MemoryStagingStore::new();
    let warehouse = MemoryWarehouse::new();
    stage(&staging, 1, 3).await;

    let _scenario =
        FailpointScenario::setup(&[(BRONZE_LOAD__BEFORE_COMMIT, "1*return(transient)")]);
    let summary = loader(&config, &staging, &warehouse).load_new().await.unwrap();

    assert_eq!(summary.loaded_objects, 1);
    assert_eq!(summary.raw_records, 3);
    assert_eq!(warehouse.raw_records("customer").await.len(), 3);
}

/// Sum of the rendered bronze quarantine counters of `entity`.
fn quarantined_counter(rendered: &str, entity: &str) -> f64 {
    let entity_label = format!("entity=\"{entity}\"");

    rendered
        .lines()
        .filter(|line| line.starts_with(MEDALLION_RECORDS_QUARANTINED_TOTAL))
        .filter(|line| line.contains(&entity_label))
        .filter_map(|line| line.rsplit(' ').next()?.parse::<f64>().ok())
        .sum()
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_bronze_commit_counts_quarantined_records_once() {
    init_test_tracing();
    let metrics = init_metrics_handle().unwrap();
    let config = Arc::new(with_schema(
        test_pipeline_config(&["p0"]),
        "reloaded_customer",
        1,
        &["name"],
    ));
    let staging = MemoryStagingStore::new();
    let warehouse = MemoryWarehouse::new();
    let events = EventBuilder::new("p0", "reloaded_customer");
    let batch = Batch::new(
        partition("p0"),
        vec![
            events.insert(1, "k1", ts(1), &[("name", "a")]),
            events.insert(2, "k2", ts(2), &[]),
        ],
    )
    .unwrap();
    staging
        .put_if_absent(&batch.staged_name().to_string(), batch.encode().unwrap())
        .await
        .unwrap();

    let scenario = FailpointScenario::setup(&[(BRONZE_LOAD__BEFORE_COMMIT, "return")]);
    let err = loader(&config, &staging, &warehouse)
        .load_new()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InjectedFailure);
    assert_eq!(quarantined_counter(&metrics.render(), "reloaded_customer"), 0.0);
    scenario.teardown();

    let summary = loader(&config, &staging, &warehouse).load_new().await.unwrap();
    assert_eq!(summary.quarantined, 1);
    assert_eq!(quarantined_counter(&metrics.render(), "reloaded_customer"), 1.0);

    let rerun = loader(&config, &staging, &warehouse).load_new().await.unwrap();
    assert_eq!(rerun.skipped_objects, 1);
    assert_eq!(quarantined_counter(&metrics.render(), "reloaded_customer"), 1.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn permanent_bronze_commit_failure_loads_nothing() {
    init_test_tracing();
    let config = config(100);
    let staging = MemoryStagingStore::new();
    let warehouse = MemoryWarehouse::new();
    stage(&staging, 1, 3).await;

    let scenario = FailpointScenario::setup(&[(BRONZE_LOAD__BEFORE_COMMIT, "return")]);
    let err = loader(&config, &staging, &warehouse)
        .load_new()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InjectedFailure);
    assert!(warehouse.raw_records("customer").await.is_empty());
    scenario.teardown();

    let summary = loader(&config, &staging, &warehouse).load_new().await.unwrap();
    assert_eq!(summary.raw_records, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_merge_commit_keeps_watermark() {
    init_test_tracing();
    let config = config(100);
    let staging = MemoryStagingStore::new();
    let warehouse = MemoryWarehouse::new();
    stage(&staging, 1, 4).await;
    loader(&config, &staging, &warehouse).load_new().await.unwrap();

    let (_tx, rx) = create_shutdown_channel();
    let engine = MergeEngine::new(
        config.clone(),
        warehouse.clone(),
        LeaseManager::new(MemoryLeaseStore::new(), config.lease.clone()),
        rx,
    );

    let scenario = FailpointScenario::setup(&[(MERGE_WINDOW__BEFORE_COMMIT, "return")]);
    let err = engine.merge_until_caught_up("customer").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InjectedFailure);
    assert_eq!(warehouse.merge_watermark("customer").await.unwrap(), 0);
    assert!(warehouse.conformed_records("customer").await.unwrap().is_empty());
    scenario.teardown();

    let summary = engine.merge_until_caught_up("customer").await.unwrap();
    assert_eq!(summary.watermark, 4);
    assert_eq!(warehouse.conformed_records("customer").await.unwrap().len(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_snapshot_applies_nothing() {
    init_test_tracing();
    let config = config(100);
    let staging = MemoryStagingStore::new();
    let warehouse = MemoryWarehouse::new();
    stage(&staging, 1, 2).await;
    loader(&config, &staging, &warehouse).load_new().await.unwrap();

    let leases = LeaseManager::new(MemoryLeaseStore::new(), config.lease.clone());
    let (_tx, rx) = create_shutdown_channel();
    MergeEngine::new(config.clone(), warehouse.clone(), leases.clone(), rx.clone())
        .merge_until_caught_up("customer")
        .await
        .unwrap();
    let engine = SnapshotEngine::new(config.clone(), warehouse.clone(), leases, rx);

    let scenario = FailpointScenario::setup(&[(SNAPSHOT__BEFORE_APPLY, "return")]);
    let err = engine.snapshot("customer", ts(10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InjectedFailure);
    assert!(warehouse.dimension_versions("customer").await.unwrap().is_empty());
    assert_eq!(warehouse.last_snapshot_at("customer").await.unwrap(), None);
    scenario.teardown();

    let summary = engine.snapshot("customer", ts(10)).await.unwrap();
    assert_eq!(summary.opened, 2);
}
