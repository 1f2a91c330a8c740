use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Cell, ChangeEvent, Offset, Operation, PartitionKey, RowImage};

/// Durable consumer position of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadCursor {
    pub partition_key: PartitionKey,
    pub last_committed_offset: Offset,
}

/// Per-entity merge position: the highest raw record load sequence already merged.
///
/// Zero means nothing has been merged yet, since load sequences start at one.
pub type Watermark = u64;

/// One loaded change event. Raw records are append-only and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub entity: String,
    /// Gapless position of the record within its entity, assigned at load time.
    pub load_sequence: u64,
    pub partition_key: PartitionKey,
    pub offset: Offset,
    pub operation: Operation,
    pub business_key: String,
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
    pub commit_timestamp: DateTime<Utc>,
    /// Name of the staged object the record was loaded from.
    pub source_staged_object: String,
}

impl RawRecord {
    pub fn from_event(event: ChangeEvent, load_sequence: u64, source_staged_object: &str) -> Self {
        Self {
            entity: event.entity,
            load_sequence,
            partition_key: event.partition_key,
            offset: event.offset,
            operation: event.operation,
            business_key: event.business_key,
            before: event.before,
            after: event.after,
            commit_timestamp: event.commit_timestamp,
            source_staged_object: source_staged_object.to_string(),
        }
    }

    pub fn version(&self) -> RecordVersion {
        RecordVersion {
            commit_timestamp: self.commit_timestamp,
            offset: self.offset,
        }
    }
}

/// Ordering key of changes to the same business key.
///
/// Compared lexicographically: commit timestamp first, offset second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordVersion {
    pub commit_timestamp: DateTime<Utc>,
    pub offset: Offset,
}

/// Latest known state of a business key.
///
/// Deleted keys are kept with `active = false` and the attributes they had before deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformedRecord {
    pub entity: String,
    pub business_key: String,
    pub attributes: BTreeMap<String, Cell>,
    pub version: RecordVersion,
    pub active: bool,
}
