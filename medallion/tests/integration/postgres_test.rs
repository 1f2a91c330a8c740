use std::collections::BTreeMap;
use std::sync::Arc;

use medallion::concurrency::lease::{LeaseManager, LeaseScope, LeaseStage};
use medallion::concurrency::shutdown::create_shutdown_channel;
use medallion::error::ErrorKind;
use medallion::facts::FactMergeEngine;
use medallion::loader::BronzeLoader;
use medallion::merge::MergeEngine;
use medallion::snapshot::SnapshotEngine;
use medallion::staging::StagingStore;
use medallion::staging::memory::MemoryStagingStore;
use medallion::store::cursor::CursorStore;
use medallion::store::warehouse::{ConformedStore, DimensionStore, FactStore, QuarantineStore};
use medallion::test_utils::config::{test_pipeline_config, with_dimension, with_schema};
use medallion::test_utils::database::spawn_warehouse_database;
use medallion::test_utils::event::{EventBuilder, partition, text, ts};
use medallion::types::{
    Batch, Cell, ChangeEvent, DimensionReference, FactSource, LoadCursor, QuarantineReason,
    QuarantineStage,
};
use medallion_config::shared::LeaseConfig;
use medallion_telemetry::tracing::init_test_tracing;

async fn stage(staging: &MemoryStagingStore, events: Vec<ChangeEvent>) {
    let batch = Batch::new(partition("p0"), events).unwrap();
    staging
        .put_if_absent(&batch.staged_name().to_string(), batch.encode().unwrap())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn postgres_warehouse_runs_every_stage() {
    init_test_tracing();
    let database = spawn_warehouse_database().await;
    let warehouse = database.warehouse();
    let config = with_dimension(test_pipeline_config(&["p0"]), "customer", &["tier"]);
    let config = Arc::new(with_schema(config, "customer", 1, &["name"]));
    let leases = LeaseManager::new(database.lease_store(), config.lease.clone());
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let staging = MemoryStagingStore::new();
    let events = EventBuilder::new("p0", "customer");
    stage(
        &staging,
        vec![
            events.insert(1, "k1", ts(1), &[("name", "Ada"), ("tier", "A")]),
            events.insert(2, "k2", ts(1), &[("tier", "A")]),
            events.insert(3, "k3", ts(2), &[("name", "Bob"), ("tier", "A")]),
        ],
    )
    .await;
    stage(
        &staging,
        vec![
            events.update(4, "k1", ts(5), &[("name", "Ada"), ("tier", "B")]),
            events.delete(5, "k3", ts(6)),
        ],
    )
    .await;

    let loader = BronzeLoader::new(
        config.clone(),
        staging.clone(),
        warehouse.clone(),
        leases.clone(),
        shutdown_rx.clone(),
    );
    let loaded = loader.load_new().await.unwrap();
    assert_eq!(loaded.loaded_objects, 2);
    assert_eq!(loaded.raw_records, 4);
    assert_eq!(loaded.quarantined, 1);
    assert_eq!(loader.load_new().await.unwrap().skipped_objects, 2);

    let quarantined = warehouse.quarantined_records().await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].stage, QuarantineStage::Bronze);
    assert_eq!(quarantined[0].reason, QuarantineReason::SchemaViolation);
    assert_eq!(quarantined[0].record_ref, "p0:2");

    let merge = MergeEngine::new(
        config.clone(),
        warehouse.clone(),
        leases.clone(),
        shutdown_rx.clone(),
    );
    let merged = merge.merge_until_caught_up("customer").await.unwrap();
    assert_eq!(merged.watermark, 4);
    let rerun = merge.merge_window("customer", 0).await.unwrap();
    assert_eq!(rerun.upserted, 0);

    let conformed: BTreeMap<String, _> = warehouse
        .conformed_records("customer")
        .await
        .unwrap()
        .into_iter()
        .map(|record| (record.business_key.clone(), record))
        .collect();
    assert_eq!(conformed["k1"].attributes["tier"], text("B"));
    assert!(!conformed["k3"].active);
    assert!(!conformed.contains_key("k2"));

    let snapshot = SnapshotEngine::new(
        config.clone(),
        warehouse.clone(),
        leases.clone(),
        shutdown_rx.clone(),
    );
    let first = snapshot.snapshot("customer", ts(10)).await.unwrap();
    assert_eq!(first.opened, 1);
    let err = snapshot.snapshot("customer", ts(9)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SnapshotOutOfOrder);

    let facts = FactMergeEngine::new(config.clone(), warehouse.clone(), leases, shutdown_rx);
    let order = |natural_key: &str, customer: &str| FactSource {
        natural_key: natural_key.to_string(),
        event_timestamp: ts(11),
        measures: BTreeMap::from([("amount".to_string(), Cell::Integer(10))]),
        references: vec![DimensionReference {
            role: "customer".to_string(),
            entity: "customer".to_string(),
            business_key: customer.to_string(),
            required: true,
        }],
    };
    let summary = facts
        .merge_facts("orders", vec![order("o1", "k1"), order("o2", "k3")])
        .await
        .unwrap();
    assert_eq!((summary.inserted, summary.quarantined), (1, 1));
    let replay = facts
        .merge_facts("orders", vec![order("o1", "k1"), order("o2", "k3")])
        .await
        .unwrap();
    assert_eq!((replay.unchanged, replay.quarantined), (1, 1));

    let current = warehouse
        .version_at("customer", "k1", ts(11))
        .await
        .unwrap()
        .unwrap();
    let rows = warehouse.facts("orders").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].dimension_keys["customer"], current.surrogate_key);
    // Replays never duplicate quarantine rows.
    assert_eq!(warehouse.quarantined_records().await.unwrap().len(), 2);

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn postgres_cursor_never_moves_backwards() {
    init_test_tracing();
    let database = spawn_warehouse_database().await;
    let cursors = database.cursor_store();
    let cursor = |offset| LoadCursor {
        partition_key: partition("p0"),
        last_committed_offset: offset,
    };

    assert_eq!(cursors.load_cursor(&partition("p0")).await.unwrap(), None);
    cursors.commit_cursor(cursor(5)).await.unwrap();
    cursors.commit_cursor(cursor(5)).await.unwrap();
    let err = cursors.commit_cursor(cursor(3)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(
        cursors.load_cursor(&partition("p0")).await.unwrap(),
        Some(cursor(5))
    );

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn postgres_lease_is_exclusive() {
    init_test_tracing();
    let database = spawn_warehouse_database().await;
    let config = LeaseConfig {
        ttl_ms: 30_000,
        acquire_timeout_ms: 100,
    };
    let first = LeaseManager::new(database.lease_store(), config.clone());
    let second = LeaseManager::new(database.lease_store(), config);
    let scope = LeaseScope::new(LeaseStage::Merge, "customer");

    let held = first.acquire(scope.clone()).await.unwrap();
    let err = second.acquire(scope.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LeaseUnavailable);

    // Another scope of the same stage is independent.
    let other = second
        .acquire(LeaseScope::new(LeaseStage::Merge, "orders"))
        .await
        .unwrap();
    other.release().await.unwrap();

    held.release().await.unwrap();
    let taken_over = second.acquire(scope).await.unwrap();
    taken_over.release().await.unwrap();

    database.drop_database().await;
}
