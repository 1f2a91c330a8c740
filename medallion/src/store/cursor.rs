use std::future::Future;

use crate::error::EtlResult;
use crate::types::{LoadCursor, PartitionKey};

/// Storage of per-partition consumer cursors.
///
/// A cursor never moves backwards: committing an offset lower than the stored one fails with
/// [`crate::error::ErrorKind::InvalidState`] and committing the stored offset again is a no-op.
pub trait CursorStore {
    /// Returns the committed cursor of `partition_key`, or `None` if nothing was committed yet.
    fn load_cursor(
        &self,
        partition_key: &PartitionKey,
    ) -> impl Future<Output = EtlResult<Option<LoadCursor>>> + Send;

    /// Durably stores `cursor`. Returns once the write is durable.
    fn commit_cursor(&self, cursor: LoadCursor) -> impl Future<Output = EtlResult<()>> + Send;
}

/// Fails if `next` would move the cursor backwards. Returns `false` when `next` equals the stored
/// cursor, in which case nothing has to be written.
pub(crate) fn check_cursor_advance(
    stored: Option<&LoadCursor>,
    next: &LoadCursor,
) -> EtlResult<bool> {
    let Some(stored) = stored else {
        return Ok(true);
    };

    if next.last_committed_offset < stored.last_committed_offset {
        crate::bail!(
            crate::error::ErrorKind::InvalidState,
            "Load cursor cannot move backwards",
            format!(
                "Partition `{}` is committed at offset {} but offset {} was requested",
                next.partition_key, stored.last_committed_offset, next.last_committed_offset
            )
        );
    }

    Ok(next.last_committed_offset > stored.last_committed_offset)
}
