use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::staging::{PutOutcome, StagingStore};

/// In-memory staging store, for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStagingStore {
    objects: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

impl StagingStore for MemoryStagingStore {
    async fn put_if_absent(&self, name: &str, bytes: Bytes) -> EtlResult<PutOutcome> {
        let mut objects = self.objects.write().await;

        if objects.contains_key(name) {
            return Ok(PutOutcome::AlreadyExists);
        }
        objects.insert(name.to_string(), bytes);

        Ok(PutOutcome::Created)
    }

    async fn get(&self, name: &str) -> EtlResult<Bytes> {
        let objects = self.objects.read().await;

        objects.get(name).cloned().ok_or_else(|| {
            etl_error!(
                ErrorKind::StagedObjectMissing,
                "Staged object not found",
                format!("No staged object named `{name}`")
            )
        })
    }

    async fn list(&self, prefix: &str) -> EtlResult<Vec<String>> {
        let objects = self.objects.read().await;

        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_put_reports_existing_object() {
        let store = MemoryStagingStore::new();

        let first = store.put_if_absent("a/1", Bytes::from("one")).await.unwrap();
        let second = store.put_if_absent("a/1", Bytes::from("two")).await.unwrap();

        assert_eq!(first, PutOutcome::Created);
        assert_eq!(second, PutOutcome::AlreadyExists);
        assert_eq!(store.get("a/1").await.unwrap(), Bytes::from("one"));
    }

    #[tokio::test]
    async fn list_filters_by_prefix_in_order() {
        let store = MemoryStagingStore::new();
        for name in ["b/2", "a/2", "a/1", "ab/1"] {
            store.put_if_absent(name, Bytes::new()).await.unwrap();
        }

        assert_eq!(store.list("a/").await.unwrap(), vec!["a/1", "a/2"]);
        assert_eq!(store.list("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn missing_object_is_reported() {
        let store = MemoryStagingStore::new();

        let err = store.get("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StagedObjectMissing);
    }
}
