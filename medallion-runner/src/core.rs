use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use medallion::concurrency::lease::{LeaseManager, LeaseStore};
use medallion::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use medallion::facts::FactMergeEngine;
use medallion::loader::BronzeLoader;
use medallion::merge::MergeEngine;
use medallion::pipeline::Pipeline;
use medallion::snapshot::SnapshotEngine;
use medallion::source::file::FileSource;
use medallion::store::memory::{MemoryLeaseStore, MemoryWarehouse};
use medallion::store::postgres::{PostgresLeaseStore, PostgresWarehouse};
use medallion::store::warehouse::{
    ConformedStore, DimensionStore, FactStore, QuarantineStore, RawStore,
};
use medallion::types::FactSource;
use medallion_config::shared::{
    BatchConfig, PipelineConfig, RunnerConfig, SourceConfig, WarehouseConfig,
};
use medallion_postgres::pool::{connect_warehouse, migrate_warehouse};
use sqlx::PgPool;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use crate::Command;
use crate::stores::{RunnerCursorStore, RunnerStagingStore};

/// Runs `command` against the warehouse selected by the configuration.
///
/// Each warehouse gets the lease store living next to it, so leases are shared by every process
/// working on the same warehouse.
pub async fn run_command(config: RunnerConfig, command: Command) -> anyhow::Result<()> {
    log_pipeline_config(&config.pipeline);

    match &config.warehouse {
        WarehouseConfig::Memory => {
            debug!("using memory warehouse");
            if matches!(command, Command::Migrate) {
                info!("memory warehouse has no migrations to apply");
                return Ok(());
            }

            let runner =
                Runner::new(config, MemoryWarehouse::new(), MemoryLeaseStore::new(), None)?;
            runner.run(command).await
        }
        WarehouseConfig::Postgres {
            connection,
            max_connections,
        } => {
            debug!(
                host = connection.host,
                port = connection.port,
                dbname = connection.name,
                username = connection.username,
                tls_enabled = connection.tls.enabled,
                max_connections,
                "using postgres warehouse"
            );
            let pool = connect_warehouse(connection, *max_connections).await?;
            migrate_warehouse(&pool).await?;
            if matches!(command, Command::Migrate) {
                return Ok(());
            }

            let runner = Runner::new(
                config,
                PostgresWarehouse::new(pool.clone()),
                PostgresLeaseStore::new(pool.clone()),
                Some(pool),
            )?;
            runner.run(command).await
        }
    }
}

struct Runner<W, L> {
    config: RunnerConfig,
    pipeline_config: Arc<PipelineConfig>,
    warehouse: W,
    leases: LeaseManager<L>,
    lease_store: L,
    staging: RunnerStagingStore,
    cursors: RunnerCursorStore,
    shutdown_tx: ShutdownTx,
    // Held so the engines' shutdown receivers only observe explicit shutdowns.
    shutdown_rx: ShutdownRx,
}

impl<W, L> Runner<W, L>
where
    W: RawStore
        + ConformedStore
        + DimensionStore
        + FactStore
        + QuarantineStore
        + Clone
        + Send
        + Sync
        + 'static,
    L: LeaseStore + Clone + Send + Sync + 'static,
{
    fn new(
        config: RunnerConfig,
        warehouse: W,
        lease_store: L,
        pool: Option<PgPool>,
    ) -> anyhow::Result<Self> {
        let staging = RunnerStagingStore::from_config(&config.staging);
        let cursors = RunnerCursorStore::from_config(&config.watermark_store, pool.as_ref())?;
        let pipeline_config = Arc::new(config.pipeline.clone());
        let leases = LeaseManager::new(lease_store.clone(), pipeline_config.lease.clone());
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        Ok(Self {
            config,
            pipeline_config,
            warehouse,
            leases,
            lease_store,
            staging,
            cursors,
            shutdown_tx,
            shutdown_rx,
        })
    }

    async fn run(self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Consume => self.consume(None).await,
            Command::Run { interval_secs } => {
                self.consume(Some(Duration::from_secs(interval_secs.max(1))))
                    .await
            }
            Command::Load => {
                let summary = self.loader().load_new().await?;
                info!(?summary, "load finished");
                Ok(())
            }
            Command::Merge { entity, since } => {
                let merge = self.merge_engine();
                match since {
                    Some(since) => {
                        let result = merge.merge_window(&entity, since).await?;
                        info!(entity = %entity, ?result, "merge window finished");
                    }
                    None => {
                        let summary = merge.merge_until_caught_up(&entity).await?;
                        info!(entity = %entity, ?summary, "merge finished");
                    }
                }
                Ok(())
            }
            Command::Snapshot { entity, as_of } => {
                let as_of = as_of.unwrap_or_else(Utc::now);
                let summary = self.snapshot_engine().snapshot(&entity, as_of).await?;
                info!(entity = %entity, %as_of, ?summary, "snapshot finished");
                Ok(())
            }
            Command::Facts { table, input } => {
                let sources = read_fact_sources(&input).await?;
                let engine = FactMergeEngine::new(
                    self.pipeline_config.clone(),
                    self.warehouse.clone(),
                    self.leases.clone(),
                    self.shutdown_rx.clone(),
                );
                let summary = engine.merge_facts(&table, sources).await?;
                info!(table = %table, ?summary, "fact merge finished");
                Ok(())
            }
            // Handled before the stores are built.
            Command::Migrate => Ok(()),
        }
    }

    /// Runs the consumers until a shutdown signal arrives. With `cycle_interval`, also loads,
    /// merges and snapshots every configured dimension at that interval.
    async fn consume(&self, cycle_interval: Option<Duration>) -> anyhow::Result<()> {
        let source = match &self.config.source {
            Some(source) => {
                let SourceConfig::FileSystem { root, .. } = source;
                debug!(root = %root.display(), "using file system source");
                FileSource::new(root.clone(), source.poll_interval())
            }
            None => anyhow::bail!("consuming requires a `source` in the configuration"),
        };

        let mut pipeline = Pipeline::new(
            self.pipeline_config.clone(),
            source,
            self.staging.clone(),
            self.cursors.clone(),
            self.lease_store.clone(),
        );
        pipeline.start().await?;

        let cycles = async {
            let Some(interval) = cycle_interval else {
                return std::future::pending::<anyhow::Result<()>>().await;
            };

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_cycle().await?;
            }
        };

        let result = tokio::select! {
            _ = wait_for_signal() => Ok(()),
            result = cycles => result,
        };

        // Pending events are flushed by the consumers before they stop.
        pipeline.shutdown();
        self.shutdown_tx.shutdown().ok();
        pipeline.wait().await?;

        result
    }

    /// Loads new staged objects, then merges and snapshots every configured dimension.
    async fn run_cycle(&self) -> anyhow::Result<()> {
        let loaded = self.loader().load_new().await?;
        debug!(?loaded, "cycle load finished");

        let merge = self.merge_engine();
        let snapshot = self.snapshot_engine();
        for dimension in &self.pipeline_config.dimensions {
            let merged = merge
                .merge_until_caught_up(&dimension.entity)
                .await
                .with_context(|| format!("merging `{}`", dimension.entity))?;
            let snapshotted = snapshot
                .snapshot(&dimension.entity, Utc::now())
                .await
                .with_context(|| format!("snapshotting `{}`", dimension.entity))?;
            info!(
                entity = %dimension.entity,
                raw_records = merged.raw_records,
                opened = snapshotted.opened,
                closed = snapshotted.closed,
                "cycle finished"
            );
        }

        Ok(())
    }

    fn loader(&self) -> BronzeLoader<RunnerStagingStore, W, L> {
        BronzeLoader::new(
            self.pipeline_config.clone(),
            self.staging.clone(),
            self.warehouse.clone(),
            self.leases.clone(),
            self.shutdown_rx.clone(),
        )
    }

    fn merge_engine(&self) -> MergeEngine<W, L> {
        MergeEngine::new(
            self.pipeline_config.clone(),
            self.warehouse.clone(),
            self.leases.clone(),
            self.shutdown_rx.clone(),
        )
    }

    fn snapshot_engine(&self) -> SnapshotEngine<W, L> {
        SnapshotEngine::new(
            self.pipeline_config.clone(),
            self.warehouse.clone(),
            self.leases.clone(),
            self.shutdown_rx.clone(),
        )
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_signal() {
    let sigterm = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to register sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("sigint (ctrl+c) received, shutting down");
        }
        _ = sigterm => {
            info!("sigterm received, shutting down");
        }
    }
}

/// Reads one [`FactSource`] per non-empty line of `path`.
async fn read_fact_sources(path: &std::path::Path) -> anyhow::Result<Vec<FactSource>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading `{}`", path.display()))?;

    parse_fact_sources(&content).with_context(|| format!("parsing `{}`", path.display()))
}

fn parse_fact_sources(content: &str) -> anyhow::Result<Vec<FactSource>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("invalid fact source on line {}", index + 1))
        })
        .collect()
}

fn log_pipeline_config(config: &PipelineConfig) {
    debug!(
        pipeline_id = config.id,
        partitions = ?config.partitions,
        operation_deadline_ms = config.operation_deadline_ms,
        merge_window_size = config.merge_window_size,
        "pipeline config"
    );
    log_batch_config(&config.batch);
}

fn log_batch_config(config: &BatchConfig) {
    debug!(
        max_size = config.max_size,
        max_fill_ms = config.max_fill_ms,
        max_buffered_events = config.max_buffered_events,
        "batch config"
    );
}
