use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::staging::{PutOutcome, StagingStore};
use crate::store::file::{directories_to_sync, sync_dir};

/// Directory holding partially written objects. Never listed.
const TMP_DIR: &str = ".tmp";

/// Staging store keeping every object as a file under a root directory.
///
/// Object names map to relative paths. A write lands in a temporary file first, is synced, and
/// is then hard-linked to its final path; linking fails if the path exists, which gives the
/// create-if-absent guarantee without ever exposing a partial object. Every directory between
/// the object and the root is synced before a put returns, so a reported object survives a
/// power loss.
#[derive(Debug, Clone)]
pub struct FileSystemStagingStore {
    root: PathBuf,
}

impl FileSystemStagingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> EtlResult<PathBuf> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(part) if part != TMP_DIR));
        if !valid {
            bail!(
                ErrorKind::InvalidData,
                "Invalid staged object name",
                format!("`{name}` is not a relative object path")
            );
        }

        Ok(self.root.join(relative))
    }

    async fn sync_object_dirs(&self, path: &Path) -> EtlResult<()> {
        for dir in directories_to_sync(&self.root, path) {
            sync_dir(&dir).await?;
        }

        Ok(())
    }
}

impl StagingStore for FileSystemStagingStore {
    async fn put_if_absent(&self, name: &str, bytes: Bytes) -> EtlResult<PutOutcome> {
        let path = self.object_path(name)?;
        // The object may have been linked by a writer that crashed before syncing.
        if tokio::fs::try_exists(&path).await? {
            self.sync_object_dirs(&path).await?;
            return Ok(PutOutcome::AlreadyExists);
        }

        let tmp_dir = self.root.join(TMP_DIR);
        tokio::fs::create_dir_all(&tmp_dir).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = tmp_dir.join(Uuid::new_v4().to_string());
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        let linked = tokio::fs::hard_link(&tmp_path, &path).await;
        // The temporary file is garbage whatever the outcome.
        let _ = tokio::fs::remove_file(&tmp_path).await;

        let outcome = match linked {
            Ok(()) => PutOutcome::Created,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                PutOutcome::AlreadyExists
            }
            Err(err) => return Err(err.into()),
        };
        self.sync_object_dirs(&path).await?;

        if outcome == PutOutcome::Created {
            debug!(object = name, bytes = bytes.len(), "staged object written");
        }

        Ok(outcome)
    }

    async fn get(&self, name: &str) -> EtlResult<Bytes> {
        let path = self.object_path(name)?;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(etl_error!(
                ErrorKind::StagedObjectMissing,
                "Staged object not found",
                format!("No staged object at `{}`", path.display()),
                source: err
            )),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> EtlResult<Vec<String>> {
        let mut names = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, dir_name)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if dir_name.is_empty() && file_name == TMP_DIR {
                    continue;
                }

                let name = format!("{dir_name}{file_name}");
                if entry.file_type().await?.is_dir() {
                    let dir_prefix = format!("{name}/");
                    // Only descend into directories that can contain matching names.
                    if dir_prefix.starts_with(prefix) || prefix.starts_with(&dir_prefix) {
                        pending.push((entry.path(), dir_prefix));
                    }
                } else if name.starts_with(prefix) {
                    names.push(name);
                }
            }
        }

        names.sort();

        Ok(names)
    }
}
