use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, EtlError, EtlResult};

/// Position of a change event within its partition.
pub type Offset = u64;

/// Identifies an ordered stream of change events.
///
/// Partition keys become part of staged object names, so they are restricted to ASCII letters,
/// digits, `_`, `-` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> EtlResult<Self> {
        let key = key.into();

        let valid_chars = key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if key.is_empty() || !valid_chars || key == "." || key == ".." {
            bail!(
                ErrorKind::InvalidData,
                "Invalid partition key",
                format!("`{key}` must be non-empty and only contain ASCII letters, digits, `_`, `-` or `.`")
            );
        }

        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PartitionKey {
    type Error = EtlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PartitionKey::new(value)
    }
}

impl From<PartitionKey> for String {
    fn from(value: PartitionKey) -> Self {
        value.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// A single typed value of a row image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Cell {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Integer(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Float(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Bool(value)
    }
}

impl From<DateTime<Utc>> for Cell {
    fn from(value: DateTime<Utc>) -> Self {
        Cell::Timestamp(value)
    }
}

/// State of a row before or after a change.
///
/// Known fields are typed [`Cell`]s. Fields the producer could not type travel untouched in
/// `extensions` and are ignored by the transformations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowImage {
    pub schema_version: u32,
    pub fields: BTreeMap<String, Cell>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl RowImage {
    pub fn new(schema_version: u32) -> Self {
        Self {
            schema_version,
            ..Self::default()
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Cell>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// A captured insert, update or delete of a source row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub partition_key: PartitionKey,
    pub offset: Offset,
    /// Source entity (table) the row belongs to.
    pub entity: String,
    pub operation: Operation,
    pub business_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<RowImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<RowImage>,
    pub commit_timestamp: DateTime<Utc>,
}
