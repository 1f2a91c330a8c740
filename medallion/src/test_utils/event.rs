use chrono::{DateTime, TimeZone, Utc};

use crate::types::{Cell, ChangeEvent, Offset, Operation, PartitionKey, RowImage};

/// Timestamp `secs` seconds after a fixed epoch, so tests read as relative times.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("timestamp in range")
}

pub fn partition(key: &str) -> PartitionKey {
    PartitionKey::new(key).expect("valid partition key")
}

/// Builds a schema version 1 image from `fields`.
pub fn image(fields: &[(&str, &str)]) -> RowImage {
    fields
        .iter()
        .fold(RowImage::new(1), |image, (name, value)| image.with_field(*name, *value))
}

/// Builder for change events of one entity.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    partition_key: PartitionKey,
    entity: String,
}

impl EventBuilder {
    pub fn new(partition_key: &str, entity: &str) -> Self {
        Self {
            partition_key: partition(partition_key),
            entity: entity.to_string(),
        }
    }

    pub fn insert(
        &self,
        offset: Offset,
        business_key: &str,
        at: DateTime<Utc>,
        fields: &[(&str, &str)],
    ) -> ChangeEvent {
        self.event(offset, Operation::Insert, business_key, at, None, Some(image(fields)))
    }

    pub fn update(
        &self,
        offset: Offset,
        business_key: &str,
        at: DateTime<Utc>,
        fields: &[(&str, &str)],
    ) -> ChangeEvent {
        self.event(offset, Operation::Update, business_key, at, None, Some(image(fields)))
    }

    pub fn delete(&self, offset: Offset, business_key: &str, at: DateTime<Utc>) -> ChangeEvent {
        self.event(offset, Operation::Delete, business_key, at, None, None)
    }

    /// Sequential inserts `first..=last` with business keys `k{offset}`.
    pub fn inserts(&self, first: Offset, last: Offset) -> Vec<ChangeEvent> {
        (first..=last)
            .map(|offset| {
                self.insert(
                    offset,
                    &format!("k{offset}"),
                    ts(offset as i64),
                    &[("name", "n")],
                )
            })
            .collect()
    }

    fn event(
        &self,
        offset: Offset,
        operation: Operation,
        business_key: &str,
        at: DateTime<Utc>,
        before: Option<RowImage>,
        after: Option<RowImage>,
    ) -> ChangeEvent {
        ChangeEvent {
            partition_key: self.partition_key.clone(),
            offset,
            entity: self.entity.clone(),
            operation,
            business_key: business_key.to_string(),
            before,
            after,
            commit_timestamp: at,
        }
    }
}

/// Shorthand for a text cell.
pub fn text(value: &str) -> Cell {
    Cell::from(value)
}
