use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::source::ChangeEventSource;
use crate::types::{ChangeEvent, Offset, PartitionKey};

#[derive(Debug, Default)]
struct TailState {
    /// Byte position right after the last complete line read.
    read_position: u64,
    /// Events read but not pulled yet.
    pending: VecDeque<ChangeEvent>,
    /// Events at or below this offset are skipped.
    skip_through: Option<Offset>,
}

/// Source tailing one newline-delimited JSON file per partition, `{root}/{partition}.jsonl`.
///
/// The files are polled for appended lines. A trailing line without a newline is considered
/// incomplete and read again on the next poll.
#[derive(Debug, Clone)]
pub struct FileSource {
    root: PathBuf,
    poll_interval: Duration,
    state: Arc<Mutex<HashMap<PartitionKey, TailState>>>,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            root: root.into(),
            poll_interval,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn partition_path(&self, partition_key: &PartitionKey) -> PathBuf {
        self.root.join(format!("{partition_key}.jsonl"))
    }

    /// Reads the complete lines appended since the last read into `state.pending`.
    async fn read_appended(
        &self,
        partition_key: &PartitionKey,
        state: &mut TailState,
    ) -> EtlResult<()> {
        let path = self.partition_path(partition_key);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        file.seek(SeekFrom::Start(state.read_position)).await?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer).await?;

        let Some(last_newline) = buffer.iter().rposition(|byte| *byte == b'\n') else {
            return Ok(());
        };

        let mut events = Vec::new();
        for line in buffer[..last_newline].split(|byte| *byte == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let event: ChangeEvent = serde_json::from_slice(line).map_err(|err| {
                etl_error!(
                    ErrorKind::DeserializationError,
                    "Invalid change event line",
                    format!("{}: {err}", path.display()),
                    source: err
                )
            })?;
            if state.skip_through.is_some_and(|after| event.offset <= after) {
                continue;
            }
            events.push(event);
        }

        // State changes only after every line parsed, so a failed or cancelled read can be
        // repeated.
        state.read_position += last_newline as u64 + 1;
        state.pending.extend(events);
        trace!(partition = %partition_key, pending = state.pending.len(), "read appended lines");

        Ok(())
    }
}

impl ChangeEventSource for FileSource {
    async fn seek(&self, partition_key: &PartitionKey, after: Option<Offset>) -> EtlResult<()> {
        let mut state = self.state.lock().await;
        state.insert(
            partition_key.clone(),
            TailState {
                skip_through: after,
                ..TailState::default()
            },
        );

        Ok(())
    }

    async fn pull(&self, partition_key: &PartitionKey) -> EtlResult<ChangeEvent> {
        loop {
            {
                let mut state = self.state.lock().await;
                let tail = state.entry(partition_key.clone()).or_default();

                if tail.pending.is_empty() {
                    self.read_appended(partition_key, tail).await?;
                }
                if let Some(event) = tail.pending.pop_front() {
                    return Ok(event);
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
