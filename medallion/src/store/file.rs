use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::EtlResult;
use crate::store::cursor::{CursorStore, check_cursor_advance};
use crate::types::{LoadCursor, PartitionKey};

/// Syncs the directory `dir` so that entries created, linked or renamed in it are durable.
pub(crate) async fn sync_dir(dir: &Path) -> EtlResult<()> {
    #[cfg(unix)]
    {
        let dir = tokio::fs::File::open(dir).await?;
        dir.sync_all().await?;
    }
    #[cfg(not(unix))]
    let _ = dir;

    Ok(())
}

/// Returns the directories from the parent of `path` up to `root`, innermost first. Each of
/// them must be synced before a new file at `path` survives a power loss.
pub(crate) fn directories_to_sync(root: &Path, path: &Path) -> Vec<PathBuf> {
    path.ancestors()
        .skip(1)
        .take_while(|dir| dir.starts_with(root))
        .map(Path::to_path_buf)
        .collect()
}

/// Cursor store keeping one JSON file per partition in a directory.
///
/// Commits write a temporary file, sync it, rename it over the previous cursor and sync the
/// directory, so a crash leaves either the old or the new cursor on disk.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileCursorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cursor_path(&self, partition_key: &PartitionKey) -> PathBuf {
        self.root.join(format!("{partition_key}.json"))
    }

    async fn read_cursor(&self, partition_key: &PartitionKey) -> EtlResult<Option<LoadCursor>> {
        match tokio::fs::read(self.cursor_path(partition_key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl CursorStore for FileCursorStore {
    async fn load_cursor(&self, partition_key: &PartitionKey) -> EtlResult<Option<LoadCursor>> {
        self.read_cursor(partition_key).await
    }

    async fn commit_cursor(&self, cursor: LoadCursor) -> EtlResult<()> {
        let _guard = self.write_lock.lock().await;

        let stored = self.read_cursor(&cursor.partition_key).await?;
        if !check_cursor_advance(stored.as_ref(), &cursor)? {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.root).await?;

        let path = self.cursor_path(&cursor.partition_key);
        let tmp_path = self.root.join(format!("{}.json.tmp", cursor.partition_key));
        let bytes = serde_json::to_vec(&cursor)?;

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &path).await?;
        sync_dir(&self.root).await?;
        debug!(
            partition = %cursor.partition_key,
            offset = cursor.last_committed_offset,
            "committed cursor file"
        );

        Ok(())
    }
}
