use std::sync::Arc;

use medallion_config::shared::PipelineConfig;
use tracing::{error, info};

use crate::concurrency::lease::{LeaseManager, LeaseStore};
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{EtlError, EtlResult};
use crate::source::ChangeEventSource;
use crate::staging::StagingStore;
use crate::store::cursor::CursorStore;
use crate::types::{Offset, PartitionKey};
use crate::workers::base::{Worker, WorkerHandle};
use crate::workers::consumer::{ConsumerState, ConsumerWorker, ConsumerWorkerHandle};

#[derive(Debug)]
enum PipelineState {
    NotStarted,
    Started { consumers: Vec<ConsumerWorkerHandle> },
}

pub type PipelineId = u64;

/// Runs one consumer worker per configured partition.
///
/// The later stages are driven from outside through their engines, which can share the
/// pipeline's shutdown signal via [`Pipeline::shutdown_tx`].
#[derive(Debug)]
pub struct Pipeline<Src, St, C, L> {
    config: Arc<PipelineConfig>,
    source: Src,
    staging: St,
    cursor_store: C,
    lease_store: L,
    state: PipelineState,
    shutdown_tx: ShutdownTx,
}

impl<Src, St, C, L> Pipeline<Src, St, C, L>
where
    Src: ChangeEventSource + Clone + Send + Sync + 'static,
    St: StagingStore + Clone + Send + Sync + 'static,
    C: CursorStore + Clone + Send + Sync + 'static,
    L: LeaseStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        config: Arc<PipelineConfig>,
        source: Src,
        staging: St,
        cursor_store: C,
        lease_store: L,
    ) -> Self {
        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            config,
            source,
            staging,
            cursor_store,
            lease_store,
            state: PipelineState::NotStarted,
            shutdown_tx,
        }
    }

    pub fn id(&self) -> PipelineId {
        self.config.id
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    pub async fn start(&mut self) -> EtlResult<()> {
        info!(
            pipeline_id = self.config.id,
            partitions = self.config.partitions.len(),
            "starting pipeline"
        );

        let leases = LeaseManager::new(self.lease_store.clone(), self.config.lease.clone());

        let mut consumers = Vec::with_capacity(self.config.partitions.len());
        for partition in &self.config.partitions {
            let partition_key = PartitionKey::new(partition.as_str())?;

            let consumer = ConsumerWorker::new(
                partition_key,
                self.config.clone(),
                self.source.clone(),
                self.staging.clone(),
                self.cursor_store.clone(),
                leases.clone(),
                self.shutdown_tx.subscribe(),
            )
            .start()
            .await?;
            consumers.push(consumer);
        }

        self.state = PipelineState::Started { consumers };

        Ok(())
    }

    /// Returns the state of every consumer, in partition order of the configuration.
    pub fn consumer_states(&self) -> Vec<(PartitionKey, ConsumerState)> {
        let PipelineState::Started { consumers } = &self.state else {
            return vec![];
        };

        consumers
            .iter()
            .map(|consumer| (consumer.partition_key().clone(), consumer.state()))
            .collect()
    }

    /// Flushes every consumer and returns the committed offset of each partition.
    pub async fn checkpoint(&self) -> EtlResult<Vec<(PartitionKey, Option<Offset>)>> {
        let PipelineState::Started { consumers } = &self.state else {
            info!("pipeline was not started, nothing to checkpoint");

            return Ok(vec![]);
        };

        let mut offsets = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            offsets.push((consumer.partition_key().clone(), consumer.checkpoint().await?));
        }

        Ok(offsets)
    }

    pub async fn wait(self) -> EtlResult<()> {
        let PipelineState::Started { consumers } = self.state else {
            info!("pipeline was not started, nothing to wait for");

            return Ok(());
        };

        info!("waiting for consumer workers to complete");

        let mut errors: Vec<EtlError> = vec![];
        for consumer in consumers {
            let partition_key = consumer.partition_key().clone();
            if let Err(err) = consumer.wait().await {
                error!(partition = %partition_key, error = %err, "consumer worker failed");
                errors.push(err);
            }
        }

        if !errors.is_empty() {
            info!("{} consumer workers failed with an error", errors.len());

            return Err(errors.into());
        }

        Ok(())
    }

    pub fn shutdown(&self) {
        info!("trying to shut down the pipeline");

        if let Err(err) = self.shutdown_tx.shutdown() {
            error!("failed to send shutdown signal to the pipeline: {}", err);
            return;
        }

        info!("shut down signal successfully sent to all workers");
    }

    pub async fn shutdown_and_wait(self) -> EtlResult<()> {
        self.shutdown();
        self.wait().await
    }
}
