use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use medallion::concurrency::lease::LeaseManager;
use medallion::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use medallion::facts::FactMergeEngine;
use medallion::loader::BronzeLoader;
use medallion::merge::MergeEngine;
use medallion::pipeline::Pipeline;
use medallion::snapshot::SnapshotEngine;
use medallion::source::memory::MemorySource;
use medallion::staging::memory::MemoryStagingStore;
use medallion::store::memory::{MemoryCursorStore, MemoryLeaseStore, MemoryWarehouse};
use medallion::store::warehouse::{ConformedStore, DimensionStore, FactStore};
use medallion::test_utils::config::{test_pipeline_config, with_dimension};
use medallion::test_utils::event::{EventBuilder, partition, text, ts};
use medallion::types::{
    Cell, ChangeEvent, ConformedRecord, DimensionReference, DimensionVersion, FactSource,
};
use medallion_config::shared::PipelineConfig;
use medallion_telemetry::tracing::init_test_tracing;

/// Memory-backed medallion with every stage wired to the same stores.
struct Medallion {
    config: Arc<PipelineConfig>,
    source: MemorySource,
    staging: MemoryStagingStore,
    cursors: MemoryCursorStore,
    leases: MemoryLeaseStore,
    warehouse: MemoryWarehouse,
    // Keeps the engines' shutdown receivers open.
    _shutdown_tx: ShutdownTx,
    loader: BronzeLoader<MemoryStagingStore, MemoryWarehouse, MemoryLeaseStore>,
    merge: MergeEngine<MemoryWarehouse, MemoryLeaseStore>,
    snapshot: SnapshotEngine<MemoryWarehouse, MemoryLeaseStore>,
    facts: FactMergeEngine<MemoryWarehouse, MemoryLeaseStore>,
}

impl Medallion {
    fn new() -> Self {
        let config = with_dimension(test_pipeline_config(&["p0"]), "customer", &["tier"]);
        let config = Arc::new(config);
        let staging = MemoryStagingStore::new();
        let leases = MemoryLeaseStore::new();
        let warehouse = MemoryWarehouse::new();
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let lease_manager = LeaseManager::new(leases.clone(), config.lease.clone());

        Self {
            loader: BronzeLoader::new(
                config.clone(),
                staging.clone(),
                warehouse.clone(),
                lease_manager.clone(),
                shutdown_rx.clone(),
            ),
            merge: MergeEngine::new(
                config.clone(),
                warehouse.clone(),
                lease_manager.clone(),
                shutdown_rx.clone(),
            ),
            snapshot: SnapshotEngine::new(
                config.clone(),
                warehouse.clone(),
                lease_manager.clone(),
                shutdown_rx.clone(),
            ),
            facts: FactMergeEngine::new(
                config.clone(),
                warehouse.clone(),
                lease_manager,
                shutdown_rx,
            ),
            config,
            source: MemorySource::new(),
            staging,
            cursors: MemoryCursorStore::new(),
            leases,
            warehouse,
            _shutdown_tx: shutdown_tx,
        }
    }

    /// Runs the consumer until `events` are staged, then loads and merges them.
    async fn ingest(&self, events: Vec<ChangeEvent>) {
        let count = events.len();
        self.source.push(events).await;

        let mut pipeline = Pipeline::new(
            self.config.clone(),
            self.source.clone(),
            self.staging.clone(),
            self.cursors.clone(),
            self.leases.clone(),
        );
        pipeline.start().await.unwrap();

        // Pulled events are buffered by the consumer, so the checkpoint stages all of them.
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.source.pending(&partition("p0")).await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("consumer drained the source");

        pipeline.checkpoint().await.unwrap();
        pipeline.shutdown_and_wait().await.unwrap();

        let loaded = self.loader.load_new().await.unwrap();
        assert_eq!(loaded.raw_records + loaded.quarantined, count);
        self.merge.merge_until_caught_up("customer").await.unwrap();
    }

    async fn conformed(&self) -> BTreeMap<String, ConformedRecord> {
        self.warehouse
            .conformed_records("customer")
            .await
            .unwrap()
            .into_iter()
            .map(|record| (record.business_key.clone(), record))
            .collect()
    }

    async fn versions(&self, business_key: &str) -> Vec<DimensionVersion> {
        self.warehouse
            .dimension_versions("customer")
            .await
            .unwrap()
            .into_iter()
            .filter(|version| version.business_key == business_key)
            .collect()
    }
}

fn order(natural_key: &str, at: DateTime<Utc>, amount: i64, customer: &str) -> FactSource {
    FactSource {
        natural_key: natural_key.to_string(),
        event_timestamp: at,
        measures: BTreeMap::from([("amount".to_string(), Cell::Integer(amount))]),
        references: vec![DimensionReference {
            role: "customer".to_string(),
            entity: "customer".to_string(),
            business_key: customer.to_string(),
            required: true,
        }],
    }
}

fn assert_disjoint(versions: &[DimensionVersion]) {
    let current = versions.iter().filter(|version| version.valid_to.is_none()).count();
    assert!(current <= 1, "more than one open version: {versions:?}");

    for (i, a) in versions.iter().enumerate() {
        assert!(a.valid_to.is_none_or(|valid_to| a.valid_from < valid_to));
        assert_eq!(a.is_current, a.valid_to.is_none());
        for b in &versions[i + 1..] {
            let a_before_b = a.valid_to.is_some_and(|valid_to| valid_to <= b.valid_from);
            let b_before_a = b.valid_to.is_some_and(|valid_to| valid_to <= a.valid_from);
            assert!(a_before_b || b_before_a, "overlapping versions {a:?} and {b:?}");
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_in_same_window_keeps_last_known_attributes() {
    init_test_tracing();
    let medallion = Medallion::new();
    let events = EventBuilder::new("p0", "customer");

    medallion
        .ingest(vec![
            events.insert(1, "k1", ts(1), &[("name", "Ada"), ("tier", "A")]),
            events.update(2, "k1", ts(2), &[("name", "Ada"), ("tier", "B")]),
            events.delete(3, "k1", ts(3)),
        ])
        .await;

    let conformed = medallion.conformed().await;
    let k1 = &conformed["k1"];
    assert!(!k1.active);
    assert_eq!(k1.attributes.get("tier"), Some(&text("B")));
    assert_eq!(k1.version.commit_timestamp, ts(3));
}

#[tokio::test(flavor = "multi_thread")]
async fn tracked_change_closes_and_opens_version() {
    init_test_tracing();
    let medallion = Medallion::new();
    let events = EventBuilder::new("p0", "customer");

    medallion
        .ingest(vec![events.insert(1, "k1", ts(1), &[("name", "Ada"), ("tier", "A")])])
        .await;
    medallion.snapshot.snapshot("customer", ts(1)).await.unwrap();

    medallion
        .ingest(vec![events.update(2, "k1", ts(5), &[("name", "Ada"), ("tier", "B")])])
        .await;
    let summary = medallion.snapshot.snapshot("customer", ts(5)).await.unwrap();
    assert_eq!((summary.opened, summary.closed), (1, 1));

    let versions = medallion.versions("k1").await;
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].valid_from, ts(1));
    assert_eq!(versions[0].valid_to, Some(ts(5)));
    assert!(!versions[0].is_current);
    assert_eq!(versions[0].attributes.get("tier"), Some(&text("A")));
    assert_eq!(versions[1].valid_from, ts(5));
    assert_eq!(versions[1].valid_to, None);
    assert!(versions[1].is_current);
    assert_eq!(versions[1].attributes.get("tier"), Some(&text("B")));
}

#[tokio::test(flavor = "multi_thread")]
async fn late_fact_links_to_historical_version() {
    init_test_tracing();
    let medallion = Medallion::new();
    let events = EventBuilder::new("p0", "customer");

    medallion
        .ingest(vec![events.insert(1, "k1", ts(1), &[("tier", "A")])])
        .await;
    medallion.snapshot.snapshot("customer", ts(1)).await.unwrap();
    medallion
        .facts
        .merge_facts("orders", vec![order("o1", ts(3), 10, "k1")])
        .await
        .unwrap();

    medallion
        .ingest(vec![events.update(2, "k1", ts(5), &[("tier", "B")])])
        .await;
    medallion.snapshot.snapshot("customer", ts(5)).await.unwrap();

    // Replaying o1 and loading a late o0 after k1 moved on still resolves to the first version.
    medallion
        .facts
        .merge_facts(
            "orders",
            vec![
                order("o0", ts(2), 5, "k1"),
                order("o1", ts(3), 10, "k1"),
                order("o2", ts(7), 20, "k1"),
            ],
        )
        .await
        .unwrap();

    let versions = medallion.versions("k1").await;
    let facts: BTreeMap<String, _> = medallion
        .warehouse
        .facts("orders")
        .await
        .unwrap()
        .into_iter()
        .map(|fact| (fact.natural_key.clone(), fact))
        .collect();
    assert_eq!(facts["o0"].dimension_keys["customer"], versions[0].surrogate_key);
    assert_eq!(facts["o1"].dimension_keys["customer"], versions[0].surrogate_key);
    assert_eq!(facts["o2"].dimension_keys["customer"], versions[1].surrogate_key);
}

#[tokio::test(flavor = "multi_thread")]
async fn remerging_a_window_is_byte_identical() {
    init_test_tracing();
    let medallion = Medallion::new();
    let events = EventBuilder::new("p0", "customer");

    medallion
        .ingest(vec![
            events.insert(1, "k1", ts(1), &[("tier", "A")]),
            events.insert(2, "k2", ts(1), &[("tier", "A")]),
            events.update(3, "k1", ts(2), &[("tier", "B")]),
        ])
        .await;
    let before = serde_json::to_vec(&medallion.conformed().await).unwrap();

    let rerun = medallion.merge.merge_window("customer", 0).await.unwrap();
    assert_eq!(rerun.upserted, 0);
    let after = serde_json::to_vec(&medallion.conformed().await).unwrap();

    assert_eq!(before, after);
    assert_eq!(medallion.warehouse.merge_watermark("customer").await.unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_snapshots_keep_intervals_disjoint() {
    init_test_tracing();
    let medallion = Medallion::new();
    let events = EventBuilder::new("p0", "customer");

    let steps: Vec<(ChangeEvent, i64)> = vec![
        (events.insert(1, "k1", ts(1), &[("tier", "A")]), 1),
        (events.update(2, "k1", ts(2), &[("tier", "A"), ("name", "Ada")]), 2),
        (events.update(3, "k1", ts(3), &[("tier", "B")]), 3),
        (events.delete(4, "k1", ts(4)), 4),
        (events.insert(5, "k1", ts(6), &[("tier", "C")]), 6),
        (events.update(6, "k1", ts(8), &[("tier", "D")]), 8),
    ];

    for (event, as_of) in steps {
        medallion.ingest(vec![event]).await;
        medallion.snapshot.snapshot("customer", ts(as_of)).await.unwrap();
        // Snapshots without source changes must not open anything.
        let repeat = medallion.snapshot.snapshot("customer", ts(as_of)).await.unwrap();
        assert_eq!(repeat.opened, 0);

        assert_disjoint(&medallion.versions("k1").await);
    }

    let versions = medallion.versions("k1").await;
    let tiers: Vec<&Cell> = versions
        .iter()
        .map(|version| &version.attributes["tier"])
        .collect();
    assert_eq!(tiers, vec![&text("A"), &text("B"), &text("C"), &text("D")]);
    assert_eq!(
        medallion
            .warehouse
            .current_versions("customer")
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_fact_inputs_keep_one_row_per_key() {
    init_test_tracing();
    let medallion = Medallion::new();
    let events = EventBuilder::new("p0", "customer");

    medallion
        .ingest(vec![
            events.insert(1, "k1", ts(1), &[("tier", "A")]),
            events.insert(2, "k2", ts(1), &[("tier", "A")]),
        ])
        .await;
    medallion.snapshot.snapshot("customer", ts(1)).await.unwrap();

    let input = vec![
        order("o1", ts(3), 10, "k1"),
        order("o2", ts(3), 20, "k2"),
        order("o1", ts(3), 11, "k1"),
    ];
    for _ in 0..3 {
        medallion
            .facts
            .merge_facts("orders", input.clone())
            .await
            .unwrap();
    }

    let facts = medallion.warehouse.facts("orders").await.unwrap();
    let keys: Vec<&str> = facts.iter().map(|fact| fact.natural_key.as_str()).collect();
    assert_eq!(keys, vec!["o1", "o2"]);
    assert_eq!(facts[0].measures["amount"], Cell::Integer(11));
}
