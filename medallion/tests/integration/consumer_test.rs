use std::sync::Arc;

use medallion::concurrency::lease::LeaseManager;
use medallion::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use medallion::error::ErrorKind;
use medallion::loader::BronzeLoader;
use medallion::source::memory::MemorySource;
use medallion::staging::memory::MemoryStagingStore;
use medallion::staging::{PutOutcome, StagingStore};
use medallion::store::cursor::CursorStore;
use medallion::store::memory::{MemoryCursorStore, MemoryLeaseStore, MemoryWarehouse};
use medallion::test_utils::config::test_pipeline_config;
use medallion::test_utils::event::{EventBuilder, partition};
use medallion::test_utils::faults::{Fault, FaultyCursorStore, FaultyStagingStore};
use medallion::types::{Batch, StagedObjectName};
use medallion::workers::base::{Worker, WorkerHandle};
use medallion::workers::consumer::{ConsumerWorker, ConsumerWorkerHandle};
use medallion_config::shared::PipelineConfig;
use medallion_telemetry::tracing::init_test_tracing;

type Staging = FaultyStagingStore<MemoryStagingStore>;
type Cursors = FaultyCursorStore<MemoryCursorStore>;

struct Harness {
    config: Arc<PipelineConfig>,
    source: MemorySource,
    staging: Staging,
    cursors: Cursors,
    leases: MemoryLeaseStore,
}

impl Harness {
    fn new(config: PipelineConfig) -> Self {
        Self {
            config: Arc::new(config),
            source: MemorySource::new(),
            staging: FaultyStagingStore::new(MemoryStagingStore::new()),
            cursors: FaultyCursorStore::new(MemoryCursorStore::new()),
            leases: MemoryLeaseStore::new(),
        }
    }

    async fn start_consumer(&self) -> (ConsumerWorkerHandle, ShutdownTx) {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let handle = ConsumerWorker::new(
            partition("p0"),
            self.config.clone(),
            self.source.clone(),
            self.staging.clone(),
            self.cursors.clone(),
            LeaseManager::new(self.leases.clone(), self.config.lease.clone()),
            shutdown_rx,
        )
        .start()
        .await
        .unwrap();

        (handle, shutdown_tx)
    }

    async fn committed(&self) -> Option<u64> {
        self.cursors
            .load_cursor(&partition("p0"))
            .await
            .unwrap()
            .map(|cursor| cursor.last_committed_offset)
    }

    async fn staged_names(&self) -> Vec<String> {
        self.staging
            .list(&StagedObjectName::partition_prefix(&partition("p0")))
            .await
            .unwrap()
    }
}

fn config(max_size: usize) -> PipelineConfig {
    let mut config = test_pipeline_config(&["p0"]);
    config.batch.max_size = max_size;
    config.batch.max_fill_ms = 60_000;

    config
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_after_stage_write_loads_every_event_once() {
    init_test_tracing();
    let harness = Harness::new(config(3));
    let events = EventBuilder::new("p0", "customer");
    harness.source.push(events.inserts(1, 5)).await;

    // The first batch is written but the process dies before the cursor commit.
    harness.staging.script([Fault::CrashAfterWrite]);
    let (handle, _shutdown_tx) = harness.start_consumer().await;
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(harness.committed().await, None);
    assert_eq!(harness.staged_names().await.len(), 1);

    // The restarted consumer rolls the cursor over the staged batch and continues after it.
    let (handle, shutdown_tx) = harness.start_consumer().await;
    handle
        .wait_for_state(|state| state.open_events == 2)
        .await;
    assert_eq!(handle.checkpoint().await.unwrap(), Some(5));
    shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();

    assert_eq!(
        harness.staged_names().await,
        vec![
            StagedObjectName::new(partition("p0"), 1, 3).to_string(),
            StagedObjectName::new(partition("p0"), 4, 5).to_string(),
        ]
    );

    let warehouse = MemoryWarehouse::new();
    let (_tx, rx) = create_shutdown_channel();
    let loader = BronzeLoader::new(
        harness.config.clone(),
        harness.staging.inner().clone(),
        warehouse.clone(),
        LeaseManager::new(harness.leases.clone(), harness.config.lease.clone()),
        rx,
    );
    let summary = loader.load_new().await.unwrap();
    assert_eq!(summary.raw_records, 5);
    assert_eq!(summary.duplicates, 0);

    let offsets: Vec<u64> = warehouse
        .raw_records("customer")
        .await
        .iter()
        .map(|record| record.offset)
        .collect();
    assert_eq!(offsets, vec![1, 2, 3, 4, 5]);
}

#[tokio::test(flavor = "multi_thread")]
async fn restaging_the_same_range_is_a_no_op() {
    init_test_tracing();
    let staging = MemoryStagingStore::new();
    let events = EventBuilder::new("p0", "customer");
    let batch = Batch::new(partition("p0"), events.inserts(1, 3)).unwrap();
    let name = batch.staged_name().to_string();

    let first = staging
        .put_if_absent(&name, batch.encode().unwrap())
        .await
        .unwrap();
    let second = staging
        .put_if_absent(&name, batch.encode().unwrap())
        .await
        .unwrap();
    assert_eq!(first, PutOutcome::Created);
    assert_eq!(second, PutOutcome::AlreadyExists);
    assert_eq!(staging.len().await, 1);

    let config = Arc::new(test_pipeline_config(&["p0"]));
    let warehouse = MemoryWarehouse::new();
    let (_tx, rx) = create_shutdown_channel();
    let loader = BronzeLoader::new(
        config.clone(),
        staging.clone(),
        warehouse.clone(),
        LeaseManager::new(MemoryLeaseStore::new(), config.lease.clone()),
        rx,
    );
    loader.load_new().await.unwrap();
    loader.load_new().await.unwrap();

    assert_eq!(warehouse.raw_records("customer").await.len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_before_cursor_commit_is_recovered() {
    init_test_tracing();
    let harness = Harness::new(config(2));
    let events = EventBuilder::new("p0", "customer");
    harness.source.push(events.inserts(1, 2)).await;

    harness.cursors.script([Fault::CrashBeforeWrite]);
    let (handle, _shutdown_tx) = harness.start_consumer().await;
    assert!(handle.wait().await.is_err());
    assert_eq!(harness.committed().await, None);

    let (handle, shutdown_tx) = harness.start_consumer().await;
    handle
        .wait_for_state(|state| state.last_committed_offset == Some(2))
        .await;
    shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();

    assert_eq!(harness.committed().await, Some(2));
    assert_eq!(harness.staged_names().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_are_retried() {
    init_test_tracing();
    let harness = Harness::new(config(100));
    let events = EventBuilder::new("p0", "customer");
    harness.source.push(events.inserts(1, 5)).await;

    harness.staging.script([Fault::Transient, Fault::Transient]);
    harness.cursors.script([Fault::Transient]);
    let (handle, shutdown_tx) = harness.start_consumer().await;
    handle.wait_for_state(|state| state.open_events == 5).await;

    assert_eq!(handle.checkpoint().await.unwrap(), Some(5));
    assert_eq!(harness.staging.put_calls(), 4);
    assert_eq!(harness.cursors.commit_calls(), 2);

    shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_stop_the_consumer() {
    init_test_tracing();
    let harness = Harness::new(config(100));
    let events = EventBuilder::new("p0", "customer");
    harness.source.push(events.inserts(1, 3)).await;

    harness.staging.script([Fault::Transient; 10]);
    let (handle, _shutdown_tx) = harness.start_consumer().await;
    handle.wait_for_state(|state| state.open_events == 3).await;

    let err = handle.checkpoint().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RetriesExhausted);

    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
    assert_eq!(harness.committed().await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn full_buffer_stops_pulling() {
    init_test_tracing();
    let mut config = config(2);
    config.batch.max_buffered_events = 4;
    config.retry.initial_delay_ms = 60_000;
    config.retry.max_delay_ms = 60_000;
    let harness = Harness::new(config);
    let events = EventBuilder::new("p0", "customer");
    harness.source.push(events.inserts(1, 10)).await;

    harness.staging.script([Fault::Transient; 3]);
    let (handle, _shutdown_tx) = harness.start_consumer().await;

    let state = handle.wait_for_state(|state| state.backpressured).await;
    assert_eq!(state.sealed_events + state.open_events, 4);
    assert_eq!(harness.source.pending(&partition("p0")).await, 6);
    assert_eq!(harness.committed().await, None);
}
