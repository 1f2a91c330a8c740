use std::sync::Arc;
use std::time::Duration;

use medallion_config::shared::PipelineConfig;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, warn};

use crate::bail;
use crate::concurrency::future::optional_future;
use crate::concurrency::lease::{LeaseGuard, LeaseManager, LeaseScope, LeaseStage, LeaseStore};
use crate::concurrency::retry::{backoff_delay, retries_exhausted, with_deadline};
use crate::concurrency::shutdown::{ShutdownRx, shutdown_requested};
use crate::concurrency::timer::DeferredTimer;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::failpoints::{
    CONSUMER_FLUSH__AFTER_STAGE_WRITE, CONSUMER_FLUSH__BEFORE_STAGE_WRITE, etl_fail_point,
};
use crate::metrics::{
    MEDALLION_CONSUMER_BUFFERED_EVENTS, MEDALLION_CONSUMER_COMMITTED_OFFSET,
    MEDALLION_EVENTS_STAGED_TOTAL, MEDALLION_RETRY_ATTEMPTS_TOTAL, MEDALLION_STAGED_OBJECTS_TOTAL,
    OPERATION_LABEL, PARTITION_LABEL,
};
use crate::source::ChangeEventSource;
use crate::staging::{PutOutcome, StagingStore};
use crate::store::cursor::CursorStore;
use crate::types::{Batch, ChangeEvent, LoadCursor, Offset, PartitionKey, StagedObjectName};
use crate::workers::base::{Worker, WorkerHandle};
use crate::workers::policy::{RetryDirective, build_error_handling_policy};

/// Operation name of a staging flush in retry logs and metrics.
const FLUSH_OPERATION: &str = "consumer_flush";

/// Snapshot of a consumer's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerState {
    /// Offset of the last event whose batch is durably staged and committed.
    pub last_committed_offset: Option<Offset>,
    /// Events of the batch currently being flushed.
    pub sealed_events: usize,
    /// Events waiting for the next batch.
    pub open_events: usize,
    /// Whether pulling is paused because the buffer reached its ceiling.
    pub backpressured: bool,
}

type CheckpointReply = oneshot::Sender<EtlResult<Option<Offset>>>;

/// Handle to a running [`ConsumerWorker`].
#[derive(Debug)]
pub struct ConsumerWorkerHandle {
    partition_key: PartitionKey,
    state_rx: watch::Receiver<ConsumerState>,
    checkpoint_tx: mpsc::Sender<CheckpointReply>,
    handle: Option<JoinHandle<EtlResult<()>>>,
}

impl ConsumerWorkerHandle {
    pub fn partition_key(&self) -> &PartitionKey {
        &self.partition_key
    }

    /// Flushes every buffered event and returns the committed offset afterwards.
    pub async fn checkpoint(&self) -> EtlResult<Option<Offset>> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let stopped = || {
            etl_error!(
                ErrorKind::InvalidState,
                "Consumer is not running",
                format!("The consumer of `{}` stopped before the checkpoint", self.partition_key)
            )
        };

        self.checkpoint_tx
            .send(reply_tx)
            .await
            .map_err(|_| stopped())?;
        reply_rx.await.map_err(|_| stopped())?
    }

    /// Waits until the consumer state satisfies `predicate`, or the consumer stops.
    pub async fn wait_for_state<P>(&self, predicate: P) -> ConsumerState
    where
        P: FnMut(&ConsumerState) -> bool,
    {
        let mut state_rx = self.state_rx.clone();
        match state_rx.wait_for(predicate).await {
            Ok(state) => state.clone(),
            Err(_) => self.state_rx.borrow().clone(),
        }
    }
}

impl WorkerHandle<ConsumerState> for ConsumerWorkerHandle {
    fn state(&self) -> ConsumerState {
        self.state_rx.borrow().clone()
    }

    async fn wait(mut self) -> EtlResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.await.map_err(|err| {
            if err.is_cancelled() {
                etl_error!(
                    ErrorKind::ConsumerWorkerCancelled,
                    "Consumer worker was cancelled",
                    err
                )
            } else {
                etl_error!(ErrorKind::ConsumerWorkerPanic, "Consumer worker panicked", err)
            }
        })??;

        Ok(())
    }
}

/// Worker that consumes one partition, stages its events in batches and commits the cursor.
///
/// A flush seals the buffered events into a [`Batch`], writes it to the staging store under its
/// deterministic name and only then commits the cursor to the batch's last offset. A crash at any
/// point is safe: the restarted consumer rolls the cursor forward over batches that were staged
/// but not committed, and re-staging a range that was already written is a no-op.
#[derive(Debug)]
pub struct ConsumerWorker<Src, St, C, L> {
    partition_key: PartitionKey,
    config: Arc<PipelineConfig>,
    source: Src,
    staging: St,
    cursor_store: C,
    leases: LeaseManager<L>,
    shutdown_rx: ShutdownRx,
}

impl<Src, St, C, L> ConsumerWorker<Src, St, C, L> {
    pub fn new(
        partition_key: PartitionKey,
        config: Arc<PipelineConfig>,
        source: Src,
        staging: St,
        cursor_store: C,
        leases: LeaseManager<L>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            partition_key,
            config,
            source,
            staging,
            cursor_store,
            leases,
            shutdown_rx,
        }
    }
}

impl<Src, St, C, L> Worker<ConsumerWorkerHandle, ConsumerState> for ConsumerWorker<Src, St, C, L>
where
    Src: ChangeEventSource + Clone + Send + Sync + 'static,
    St: StagingStore + Clone + Send + Sync + 'static,
    C: CursorStore + Clone + Send + Sync + 'static,
    L: LeaseStore + Clone + Send + Sync + 'static,
{
    type Error = EtlError;

    async fn start(self) -> EtlResult<ConsumerWorkerHandle> {
        info!(partition = %self.partition_key, "starting consumer worker");

        let (state_tx, state_rx) = watch::channel(ConsumerState::default());
        let (checkpoint_tx, checkpoint_rx) = mpsc::channel(8);
        let partition_key = self.partition_key.clone();

        let span = tracing::info_span!("consumer_worker", partition = %self.partition_key);
        let consumer = async move {
            let lease = self
                .leases
                .acquire(LeaseScope::new(LeaseStage::Consumer, self.partition_key.as_str()))
                .await?;

            let mut consumer = ConsumerLoop::new(self, lease, state_tx, checkpoint_rx);
            let result = consumer.run().await;
            if let Err(err) = &result {
                error!(error = %err, "consumer worker failed");
            }

            consumer.lease.release().await?;
            result
        }
        .instrument(span.or_current());

        Ok(ConsumerWorkerHandle {
            partition_key,
            state_rx,
            checkpoint_tx,
            handle: Some(tokio::spawn(consumer)),
        })
    }
}

/// Running state of a consumer.
struct ConsumerLoop<Src, St, C, L>
where
    L: LeaseStore + Clone + Send + Sync + 'static,
{
    partition_key: PartitionKey,
    config: Arc<PipelineConfig>,
    source: Src,
    staging: St,
    cursor_store: C,
    lease: LeaseGuard<L>,
    shutdown_rx: ShutdownRx,
    state_tx: watch::Sender<ConsumerState>,
    checkpoint_rx: mpsc::Receiver<CheckpointReply>,

    last_committed_offset: Option<Offset>,
    last_seen_offset: Option<Offset>,
    /// Batch being flushed. Its range never changes until it is committed.
    sealed: Option<Batch>,
    /// Events waiting for the next batch.
    open: Vec<ChangeEvent>,
    /// Fires when the oldest open event has waited for the linger interval.
    linger_timer: DeferredTimer,
    /// Set when the linger interval elapsed while a sealed batch was still being flushed.
    linger_expired: bool,
    /// Fires when the next flush attempt of the sealed batch is due.
    retry_timer: DeferredTimer,
    failed_attempts: u32,
}

impl<Src, St, C, L> ConsumerLoop<Src, St, C, L>
where
    Src: ChangeEventSource + Clone + Send + Sync + 'static,
    St: StagingStore + Clone + Send + Sync + 'static,
    C: CursorStore + Clone + Send + Sync + 'static,
    L: LeaseStore + Clone + Send + Sync + 'static,
{
    fn new(
        worker: ConsumerWorker<Src, St, C, L>,
        lease: LeaseGuard<L>,
        state_tx: watch::Sender<ConsumerState>,
        checkpoint_rx: mpsc::Receiver<CheckpointReply>,
    ) -> Self {
        let max_fill = worker.config.batch.max_fill();

        Self {
            partition_key: worker.partition_key,
            config: worker.config,
            source: worker.source,
            staging: worker.staging,
            cursor_store: worker.cursor_store,
            lease,
            shutdown_rx: worker.shutdown_rx,
            state_tx,
            checkpoint_rx,
            last_committed_offset: None,
            last_seen_offset: None,
            sealed: None,
            open: Vec::new(),
            linger_timer: DeferredTimer::new(max_fill),
            linger_expired: false,
            retry_timer: DeferredTimer::new(Duration::ZERO),
            failed_attempts: 0,
        }
    }

    async fn run(&mut self) -> EtlResult<()> {
        self.recover().await?;

        let renew_period = (self.lease.ttl() / 3).max(Duration::from_millis(1));
        let mut renew_interval =
            tokio::time::interval_at(Instant::now() + renew_period, renew_period);
        renew_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let can_pull = self.buffered() < self.config.batch.max_buffered_events;
            self.publish_state(!can_pull);

            tokio::select! {
                biased;

                _ = shutdown_requested(&mut self.shutdown_rx) => {
                    info!(
                        buffered = self.buffered(),
                        "shutdown requested, flushing buffered events"
                    );
                    self.flush_all().await?;
                    info!(offset = ?self.last_committed_offset, "consumer stopped");

                    return Ok(());
                }

                Some(reply) = self.checkpoint_rx.recv() => {
                    let result = self.flush_all().await.map(|_| self.last_committed_offset);
                    // A fatal flush error stops the consumer as well as failing the checkpoint.
                    let fatal = result.as_ref().err().cloned();
                    let _ = reply.send(result);
                    if let Some(err) = fatal {
                        return Err(err);
                    }
                }

                _ = renew_interval.tick() => {
                    self.lease.renew().await?;
                }

                _ = &mut self.retry_timer => {
                    debug!(attempt = self.failed_attempts + 1, "retrying staging flush");
                }

                _ = &mut self.linger_timer => {
                    debug!(open = self.open.len(), "linger interval elapsed");
                    self.linger_expired = true;
                }

                event = optional_future(
                    can_pull.then(|| self.source.pull(&self.partition_key))
                ) => {
                    self.accept(event?)?;
                }
            }

            self.seal_if_due();
            if self.sealed.is_some() && !self.retry_timer.is_armed() {
                self.try_flush_sealed().await?;
                // The open buffer may already be due once the previous batch is out.
                self.seal_if_due();
                if self.sealed.is_some() && !self.retry_timer.is_armed() {
                    self.try_flush_sealed().await?;
                }
            }
        }
    }

    /// Loads the cursor, rolls it forward over staged but uncommitted batches and positions the
    /// source right after it.
    async fn recover(&mut self) -> EtlResult<()> {
        let deadline = self.config.operation_deadline();

        let cursor = with_deadline(
            "load_cursor",
            deadline,
            self.cursor_store.load_cursor(&self.partition_key),
        )
        .await?;
        let committed = cursor.map(|cursor| cursor.last_committed_offset);

        let prefix = StagedObjectName::partition_prefix(&self.partition_key);
        let names =
            with_deadline("list_staged_objects", deadline, self.staging.list(&prefix)).await?;

        let mut staged: Vec<StagedObjectName> = Vec::with_capacity(names.len());
        for name in names {
            match name.parse::<StagedObjectName>() {
                Ok(parsed) if parsed.partition_key == self.partition_key => staged.push(parsed),
                Ok(_) => {}
                Err(err) => {
                    warn!(object = %name, error = %err, "ignoring unrecognized staged object")
                }
            }
        }
        staged.sort_by_key(|name| (name.min_offset, name.max_offset));

        // Batches are staged one at a time after the previous cursor commit, so every staged
        // object above the cursor continues the committed prefix.
        let mut rolled_forward = committed;
        for name in &staged {
            if rolled_forward.is_none_or(|offset| name.max_offset > offset) {
                rolled_forward = Some(name.max_offset);
            }
        }

        if rolled_forward != committed {
            if let Some(offset) = rolled_forward {
                info!(
                    from = ?committed,
                    to = offset,
                    "rolling cursor forward over staged batches"
                );
                self.commit_cursor(offset).await?;
            }
        }

        self.last_committed_offset = rolled_forward;
        self.last_seen_offset = rolled_forward;
        with_deadline(
            "seek_source",
            deadline,
            self.source.seek(&self.partition_key, rolled_forward),
        )
        .await?;

        info!(offset = ?rolled_forward, "consumer resuming after committed offset");

        Ok(())
    }

    fn accept(&mut self, event: ChangeEvent) -> EtlResult<()> {
        if event.partition_key != self.partition_key {
            bail!(
                ErrorKind::InvalidData,
                "Source returned an event of another partition",
                format!(
                    "Expected `{}` but got `{}` at offset {}",
                    self.partition_key, event.partition_key, event.offset
                )
            );
        }

        if let Some(last) = self.last_seen_offset {
            if event.offset <= last {
                bail!(
                    ErrorKind::NonMonotonicOffset,
                    "Source offsets are not strictly increasing",
                    format!(
                        "Offset {} follows {last} in partition `{}`",
                        event.offset, self.partition_key
                    )
                );
            }
        }

        self.last_seen_offset = Some(event.offset);
        if self.open.is_empty() {
            self.linger_timer.start_if_idle();
        }
        self.open.push(event);

        Ok(())
    }

    fn buffered(&self) -> usize {
        self.sealed.as_ref().map_or(0, Batch::len) + self.open.len()
    }

    /// Seals the open buffer when it is full or has lingered long enough and no other batch is
    /// in flight.
    fn seal_if_due(&mut self) {
        if self.sealed.is_some() || self.open.is_empty() {
            return;
        }

        let max_size = self.config.batch.max_size;
        if self.open.len() < max_size && !self.linger_expired {
            return;
        }

        if let Err(err) = self.seal(max_size) {
            // Only reachable if the invariants of the open buffer are broken.
            error!(error = %err, "failed to seal batch");
        }
    }

    fn seal(&mut self, max_size: usize) -> EtlResult<()> {
        let take = self.open.len().min(max_size);
        let events: Vec<ChangeEvent> = self.open.drain(..take).collect();
        let batch = Batch::new(self.partition_key.clone(), events)?;
        debug!(
            batch_id = %batch.batch_id(),
            events = batch.len(),
            "sealed batch"
        );

        self.sealed = Some(batch);
        self.failed_attempts = 0;
        self.linger_timer.stop();
        self.linger_expired = false;
        if !self.open.is_empty() {
            self.linger_timer.start();
        }

        Ok(())
    }

    /// Makes one attempt at flushing the sealed batch. Transient failures arm the retry timer;
    /// permanent failures and exhausted retries are returned.
    async fn try_flush_sealed(&mut self) -> EtlResult<()> {
        let Some(batch) = self.sealed.as_ref() else {
            return Ok(());
        };

        match self.flush_batch(batch).await {
            Ok(()) => {
                self.on_flushed();
                Ok(())
            }
            Err(err) => {
                let delay = self.on_flush_failure(err)?;
                self.retry_timer = DeferredTimer::new(delay);
                self.retry_timer.start();

                Ok(())
            }
        }
    }

    /// Flushes the sealed batch and then the whole open buffer, waiting out retries.
    async fn flush_all(&mut self) -> EtlResult<()> {
        self.retry_timer.stop();

        loop {
            if self.sealed.is_none() {
                if self.open.is_empty() {
                    break;
                }
                self.seal(self.config.batch.max_size)?;
            }

            let Some(batch) = self.sealed.as_ref() else {
                continue;
            };
            match self.flush_batch(batch).await {
                Ok(()) => self.on_flushed(),
                Err(err) => {
                    let delay = self.on_flush_failure(err)?;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.publish_state(false);

        Ok(())
    }

    /// Writes `batch` to the staging store and commits the cursor to its last offset.
    async fn flush_batch(&self, batch: &Batch) -> EtlResult<()> {
        let deadline = self.config.operation_deadline();
        let name = batch.staged_name().to_string();

        self.lease.renew().await?;

        etl_fail_point(CONSUMER_FLUSH__BEFORE_STAGE_WRITE)?;
        let bytes = batch.encode()?;
        let outcome = with_deadline(
            "stage_batch",
            deadline,
            self.staging.put_if_absent(&name, bytes),
        )
        .await?;
        match outcome {
            PutOutcome::Created => debug!(object = %name, "staged batch"),
            PutOutcome::AlreadyExists => info!(object = %name, "batch was already staged"),
        }
        metrics::counter!(
            MEDALLION_STAGED_OBJECTS_TOTAL,
            PARTITION_LABEL => self.partition_key.to_string()
        )
        .increment(1);

        etl_fail_point(CONSUMER_FLUSH__AFTER_STAGE_WRITE)?;

        self.commit_cursor(batch.max_offset()).await
    }

    async fn commit_cursor(&self, offset: Offset) -> EtlResult<()> {
        let cursor = LoadCursor {
            partition_key: self.partition_key.clone(),
            last_committed_offset: offset,
        };

        with_deadline(
            "commit_cursor",
            self.config.operation_deadline(),
            self.cursor_store.commit_cursor(cursor),
        )
        .await
    }

    fn on_flushed(&mut self) {
        let Some(batch) = self.sealed.take() else {
            return;
        };

        self.last_committed_offset = Some(batch.max_offset());
        self.failed_attempts = 0;

        let partition = self.partition_key.to_string();
        metrics::counter!(MEDALLION_EVENTS_STAGED_TOTAL, PARTITION_LABEL => partition.clone())
            .increment(batch.len() as u64);
        metrics::gauge!(MEDALLION_CONSUMER_COMMITTED_OFFSET, PARTITION_LABEL => partition)
            .set(batch.max_offset() as f64);

        info!(
            batch_id = %batch.batch_id(),
            events = batch.len(),
            offset = batch.max_offset(),
            "batch staged and cursor committed"
        );
    }

    /// Classifies a flush failure. Returns the delay before the next attempt, or the error if
    /// it must not be retried.
    fn on_flush_failure(&mut self, err: EtlError) -> EtlResult<Duration> {
        if build_error_handling_policy(&err).retry_directive() != RetryDirective::Timed {
            return Err(err);
        }

        self.failed_attempts += 1;
        if self.failed_attempts >= self.config.retry.max_attempts {
            return Err(retries_exhausted(FLUSH_OPERATION, self.failed_attempts, err));
        }

        let delay = backoff_delay(&self.config.retry, self.failed_attempts);
        metrics::counter!(MEDALLION_RETRY_ATTEMPTS_TOTAL, OPERATION_LABEL => FLUSH_OPERATION)
            .increment(1);
        warn!(
            attempt = self.failed_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "staging flush failed, will retry"
        );

        Ok(delay)
    }

    fn publish_state(&self, backpressured: bool) {
        let state = ConsumerState {
            last_committed_offset: self.last_committed_offset,
            sealed_events: self.sealed.as_ref().map_or(0, Batch::len),
            open_events: self.open.len(),
            backpressured,
        };

        metrics::gauge!(
            MEDALLION_CONSUMER_BUFFERED_EVENTS,
            PARTITION_LABEL => self.partition_key.to_string()
        )
        .set(self.buffered() as f64);

        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}
