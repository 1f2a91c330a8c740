use std::future::Future;

use bytes::Bytes;

use crate::error::EtlResult;

/// Result of a create-if-absent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The object did not exist and was durably written.
    Created,
    /// An object with the same name already existed and was left untouched. Not an error: it
    /// is what a retried write of the same batch observes.
    AlreadyExists,
}

/// Object storage holding staged batches.
///
/// Objects are immutable: once written under a name they are never overwritten.
pub trait StagingStore {
    /// Writes `bytes` under `name` unless an object with that name already exists.
    ///
    /// Returns only once the object is durable.
    fn put_if_absent(
        &self,
        name: &str,
        bytes: Bytes,
    ) -> impl Future<Output = EtlResult<PutOutcome>> + Send;

    /// Reads an object. Fails with [`crate::error::ErrorKind::StagedObjectMissing`] if it does
    /// not exist.
    fn get(&self, name: &str) -> impl Future<Output = EtlResult<Bytes>> + Send;

    /// Lists the names starting with `prefix` in lexicographic order.
    fn list(&self, prefix: &str) -> impl Future<Output = EtlResult<Vec<String>>> + Send;
}
