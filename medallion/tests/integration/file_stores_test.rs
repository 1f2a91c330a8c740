use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use medallion::concurrency::lease::LeaseManager;
use medallion::concurrency::shutdown::create_shutdown_channel;
use medallion::loader::BronzeLoader;
use medallion::pipeline::Pipeline;
use medallion::source::file::FileSource;
use medallion::staging::StagingStore;
use medallion::staging::file::FileSystemStagingStore;
use medallion::store::cursor::CursorStore;
use medallion::store::file::FileCursorStore;
use medallion::store::memory::{MemoryLeaseStore, MemoryWarehouse};
use medallion::test_utils::config::test_pipeline_config;
use medallion::test_utils::event::{EventBuilder, partition};
use medallion::types::{ChangeEvent, STAGED_PREFIX};
use medallion_config::shared::PipelineConfig;
use medallion_telemetry::tracing::init_test_tracing;
use tokio::io::AsyncWriteExt;

async fn append_lines(path: &Path, events: &[ChangeEvent]) {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .unwrap();
    for event in events {
        let mut line = serde_json::to_vec(event).unwrap();
        line.push(b'\n');
        file.write_all(&line).await.unwrap();
    }
    file.flush().await.unwrap();
}

struct FileDirs {
    root: tempfile::TempDir,
    source: FileSource,
    staging: FileSystemStagingStore,
    cursors: FileCursorStore,
}

impl FileDirs {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let source = FileSource::new(root.path().join("source"), Duration::from_millis(5));
        let staging = FileSystemStagingStore::new(root.path().join("staging"));
        let cursors = FileCursorStore::new(root.path().join("cursors"));

        Self {
            root,
            source,
            staging,
            cursors,
        }
    }

    fn source_path(&self, partition: &str) -> PathBuf {
        self.root.path().join("source").join(format!("{partition}.jsonl"))
    }

    /// Runs the pipeline until the cursor of every partition reaches its expected offset.
    async fn run_until(&self, config: Arc<PipelineConfig>, expected: &[(&str, u64)]) {
        let mut pipeline = Pipeline::new(
            config,
            self.source.clone(),
            self.staging.clone(),
            self.cursors.clone(),
            MemoryLeaseStore::new(),
        );
        pipeline.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let mut done = true;
                for (key, offset) in expected {
                    let cursor = self.cursors.load_cursor(&partition(key)).await.unwrap();
                    done &= cursor.is_some_and(|cursor| cursor.last_committed_offset == *offset);
                }
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cursors reached the expected offsets");

        pipeline.shutdown_and_wait().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn file_pipeline_resumes_after_restart() {
    init_test_tracing();
    let dirs = FileDirs::new();
    tokio::fs::create_dir_all(dirs.source_path("p0").parent().unwrap())
        .await
        .unwrap();
    let config = Arc::new(test_pipeline_config(&["p0", "p1"]));

    let p0 = EventBuilder::new("p0", "customer");
    let p1 = EventBuilder::new("p1", "customer");
    append_lines(&dirs.source_path("p0"), &p0.inserts(1, 4)).await;
    append_lines(&dirs.source_path("p1"), &p1.inserts(100, 101)).await;

    dirs.run_until(config.clone(), &[("p0", 4), ("p1", 101)])
        .await;

    // Lines appended while the pipeline was down are picked up after the committed offsets.
    append_lines(&dirs.source_path("p0"), &p0.inserts(5, 6)).await;
    dirs.run_until(config.clone(), &[("p0", 6), ("p1", 101)])
        .await;

    let staged = dirs.staging.list(STAGED_PREFIX).await.unwrap();
    assert!(staged.iter().all(|name| name.ends_with(".json")));

    let warehouse = MemoryWarehouse::new();
    let (_tx, rx) = create_shutdown_channel();
    let loader = BronzeLoader::new(
        config.clone(),
        dirs.staging.clone(),
        warehouse.clone(),
        LeaseManager::new(MemoryLeaseStore::new(), config.lease.clone()),
        rx,
    );
    let summary = loader.load_new().await.unwrap();
    assert_eq!(summary.loaded_objects, staged.len());
    assert_eq!(summary.raw_records, 8);

    let mut offsets: Vec<(String, u64)> = warehouse
        .raw_records("customer")
        .await
        .into_iter()
        .map(|record| (record.partition_key.to_string(), record.offset))
        .collect();
    offsets.sort();
    assert_eq!(
        offsets,
        vec![
            ("p0".to_string(), 1),
            ("p0".to_string(), 2),
            ("p0".to_string(), 3),
            ("p0".to_string(), 4),
            ("p0".to_string(), 5),
            ("p0".to_string(), 6),
            ("p1".to_string(), 100),
            ("p1".to_string(), 101),
        ]
    );

    let again = loader.load_new().await.unwrap();
    assert_eq!(again.loaded_objects, 0);
    assert_eq!(again.skipped_objects, staged.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn file_cursor_survives_reopen() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let key = partition("p0");

    let cursors = FileCursorStore::new(dir.path());
    cursors
        .commit_cursor(medallion::types::LoadCursor {
            partition_key: key.clone(),
            last_committed_offset: 42,
        })
        .await
        .unwrap();

    let reopened = FileCursorStore::new(dir.path());
    let cursor = reopened.load_cursor(&key).await.unwrap().unwrap();
    assert_eq!(cursor.last_committed_offset, 42);
}
