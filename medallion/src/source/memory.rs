use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::EtlResult;
use crate::source::ChangeEventSource;
use crate::types::{ChangeEvent, Offset, PartitionKey};

#[derive(Debug, Default)]
struct PartitionLog {
    events: Vec<ChangeEvent>,
    position: usize,
}

#[derive(Debug, Default)]
struct Inner {
    partitions: Mutex<HashMap<PartitionKey, PartitionLog>>,
    appended: Notify,
}

/// In-memory source backed by an append-only log per partition.
///
/// Events are kept after being pulled so the source can be rewound with
/// [`ChangeEventSource::seek`], like a replayable log.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    inner: Arc<Inner>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends events to their partitions and wakes waiting pulls.
    pub async fn push(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        let mut partitions = self.inner.partitions.lock().await;
        for event in events {
            partitions
                .entry(event.partition_key.clone())
                .or_default()
                .events
                .push(event);
        }
        drop(partitions);

        self.inner.appended.notify_waiters();
    }

    /// Number of events not pulled yet from `partition_key`.
    pub async fn pending(&self, partition_key: &PartitionKey) -> usize {
        let partitions = self.inner.partitions.lock().await;

        partitions
            .get(partition_key)
            .map(|log| log.events.len().saturating_sub(log.position))
            .unwrap_or(0)
    }
}

impl ChangeEventSource for MemorySource {
    async fn seek(&self, partition_key: &PartitionKey, after: Option<Offset>) -> EtlResult<()> {
        let mut partitions = self.inner.partitions.lock().await;

        let log = partitions.entry(partition_key.clone()).or_default();
        log.position = match after {
            Some(after) => log
                .events
                .iter()
                .position(|event| event.offset > after)
                .unwrap_or(log.events.len()),
            None => 0,
        };

        Ok(())
    }

    async fn pull(&self, partition_key: &PartitionKey) -> EtlResult<ChangeEvent> {
        loop {
            let appended = self.inner.appended.notified();
            tokio::pin!(appended);
            // Registers interest before checking, so a push between the check and the await
            // still wakes this pull.
            appended.as_mut().enable();

            {
                let mut partitions = self.inner.partitions.lock().await;
                if let Some(log) = partitions.get_mut(partition_key) {
                    if let Some(event) = log.events.get(log.position).cloned() {
                        log.position += 1;
                        return Ok(event);
                    }
                }
            }

            appended.await;
        }
    }
}
