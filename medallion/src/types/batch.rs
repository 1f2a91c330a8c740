use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::types::{ChangeEvent, Offset, PartitionKey};

/// Prefix shared by every staged object name.
pub const STAGED_PREFIX: &str = "staged/";

/// Version of the staged object payload layout.
pub const STAGED_OBJECT_FORMAT_VERSION: u32 = 1;

/// Deterministic name of a staged object.
///
/// Rendered as `staged/{partition}/{min:020}-{max:020}.json`. Zero padding keeps the
/// lexicographic order of names equal to the offset order within a partition, so re-staging the
/// same offset range always produces the same name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StagedObjectName {
    pub partition_key: PartitionKey,
    pub min_offset: Offset,
    pub max_offset: Offset,
}

impl StagedObjectName {
    pub fn new(partition_key: PartitionKey, min_offset: Offset, max_offset: Offset) -> Self {
        Self {
            partition_key,
            min_offset,
            max_offset,
        }
    }

    /// Prefix under which every staged object of `partition_key` is stored.
    pub fn partition_prefix(partition_key: &PartitionKey) -> String {
        format!("{STAGED_PREFIX}{partition_key}/")
    }
}

impl fmt::Display for StagedObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{STAGED_PREFIX}{}/{:020}-{:020}.json",
            self.partition_key, self.min_offset, self.max_offset
        )
    }
}

impl FromStr for StagedObjectName {
    type Err = EtlError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            crate::etl_error!(
                ErrorKind::InvalidData,
                "Invalid staged object name",
                format!("`{name}` does not match `{STAGED_PREFIX}{{partition}}/{{min}}-{{max}}.json`")
            )
        };

        let rest = name.strip_prefix(STAGED_PREFIX).ok_or_else(invalid)?;
        let (partition, file) = rest.split_once('/').ok_or_else(invalid)?;
        let range = file.strip_suffix(".json").ok_or_else(invalid)?;
        let (min, max) = range.split_once('-').ok_or_else(invalid)?;

        let min_offset: Offset = min.parse().map_err(|_| invalid())?;
        let max_offset: Offset = max.parse().map_err(|_| invalid())?;
        if min_offset > max_offset {
            return Err(invalid());
        }

        Ok(Self {
            partition_key: PartitionKey::new(partition)?,
            min_offset,
            max_offset,
        })
    }
}

/// An ordered, non-empty run of change events of one partition.
///
/// A batch never changes once built: retrying a flush re-stages exactly the same range.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    partition_key: PartitionKey,
    min_offset: Offset,
    max_offset: Offset,
    events: Vec<ChangeEvent>,
}

impl Batch {
    /// Builds a batch, checking that events belong to `partition_key` and have strictly
    /// increasing offsets.
    pub fn new(partition_key: PartitionKey, events: Vec<ChangeEvent>) -> EtlResult<Self> {
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            bail!(
                ErrorKind::InvalidState,
                "Empty batch",
                format!("A batch of partition `{partition_key}` must contain at least one event")
            );
        };
        let (min_offset, max_offset) = (first.offset, last.offset);

        let mut previous: Option<Offset> = None;
        for event in &events {
            if event.partition_key != partition_key {
                bail!(
                    ErrorKind::InvalidData,
                    "Event from a foreign partition",
                    format!(
                        "Event at offset {} belongs to `{}` but the batch is for `{partition_key}`",
                        event.offset, event.partition_key
                    )
                );
            }

            match previous {
                Some(previous) if event.offset <= previous => {
                    bail!(
                        ErrorKind::NonMonotonicOffset,
                        "Offsets are not strictly increasing",
                        format!(
                            "Offset {} follows {previous} in partition `{partition_key}`",
                            event.offset
                        )
                    );
                }
                _ => previous = Some(event.offset),
            }
        }

        Ok(Self {
            partition_key,
            min_offset,
            max_offset,
            events,
        })
    }

    /// Identifier of the batch, equal to its staged object name.
    pub fn batch_id(&self) -> String {
        self.staged_name().to_string()
    }

    pub fn staged_name(&self) -> StagedObjectName {
        StagedObjectName::new(self.partition_key.clone(), self.min_offset, self.max_offset)
    }

    pub fn partition_key(&self) -> &PartitionKey {
        &self.partition_key
    }

    pub fn min_offset(&self) -> Offset {
        self.min_offset
    }

    pub fn max_offset(&self) -> Offset {
        self.max_offset
    }

    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<ChangeEvent> {
        self.events
    }

    /// Serializes the batch into its staged payload.
    pub fn encode(&self) -> EtlResult<Bytes> {
        let staged = StagedBatch {
            format_version: STAGED_OBJECT_FORMAT_VERSION,
            partition_key: self.partition_key.clone(),
            min_offset: self.min_offset,
            max_offset: self.max_offset,
            events: self.events.clone(),
        };

        let bytes = serde_json::to_vec(&staged).map_err(|err| {
            crate::etl_error!(
                ErrorKind::SerializationError,
                "Failed to serialize batch",
                err.to_string(),
                source: err
            )
        })?;

        Ok(Bytes::from(bytes))
    }
}

/// Payload layout of a staged object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedBatch {
    pub format_version: u32,
    pub partition_key: PartitionKey,
    pub min_offset: Offset,
    pub max_offset: Offset,
    pub events: Vec<ChangeEvent>,
}

impl StagedBatch {
    /// Decodes a staged payload and checks that it matches the object's name.
    pub fn decode(name: &StagedObjectName, bytes: &[u8]) -> EtlResult<Batch> {
        let staged: StagedBatch = serde_json::from_slice(bytes)?;

        if staged.format_version != STAGED_OBJECT_FORMAT_VERSION {
            bail!(
                ErrorKind::DeserializationError,
                "Unsupported staged object format",
                format!(
                    "`{name}` uses format version {} but {STAGED_OBJECT_FORMAT_VERSION} is expected",
                    staged.format_version
                )
            );
        }

        if staged.partition_key != name.partition_key
            || staged.min_offset != name.min_offset
            || staged.max_offset != name.max_offset
        {
            bail!(
                ErrorKind::DeserializationError,
                "Staged object content does not match its name",
                format!(
                    "`{name}` contains partition `{}` offsets {}..={}",
                    staged.partition_key, staged.min_offset, staged.max_offset
                )
            );
        }

        let batch = Batch::new(staged.partition_key, staged.events)?;
        if batch.min_offset != name.min_offset || batch.max_offset != name.max_offset {
            bail!(
                ErrorKind::DeserializationError,
                "Staged object events do not match its name",
                format!(
                    "`{name}` holds events {}..={}",
                    batch.min_offset, batch.max_offset
                )
            );
        }

        Ok(batch)
    }
}
