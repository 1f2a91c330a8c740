use std::future::Future;

use crate::error::EtlResult;
use crate::types::{ChangeEvent, Offset, PartitionKey};

/// Ordered stream of change events per partition.
///
/// A source must deliver strictly increasing offsets within a partition and must be able to
/// resume right after an arbitrary offset.
pub trait ChangeEventSource {
    /// Positions `partition_key` so the next pull returns the first event with an offset
    /// greater than `after`, or the first event of the partition when `after` is `None`.
    fn seek(
        &self,
        partition_key: &PartitionKey,
        after: Option<Offset>,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Returns the next event of `partition_key`, waiting until one is available.
    ///
    /// Must be cancel safe: dropping the future before it resolves must not lose an event.
    fn pull(
        &self,
        partition_key: &PartitionKey,
    ) -> impl Future<Output = EtlResult<ChangeEvent>> + Send;
}
