use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stage that isolated a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineStage {
    Bronze,
    Fact,
}

impl QuarantineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineStage::Bronze => "bronze",
            QuarantineStage::Fact => "fact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    SchemaViolation,
    OrphanReference,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineReason::SchemaViolation => "schema_violation",
            QuarantineReason::OrphanReference => "orphan_reference",
        }
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record set aside for review instead of being processed.
///
/// Unique by `(stage, scope, record_ref)`, so replaying the same input never duplicates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub stage: QuarantineStage,
    /// Entity (bronze) or fact table (fact) the record belongs to.
    pub scope: String,
    /// `{partition}:{offset}` for bronze records, the natural key for facts.
    pub record_ref: String,
    pub reason: QuarantineReason,
    pub detail: String,
    pub payload: serde_json::Value,
    /// Set by the store when the record is first quarantined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantined_at: Option<DateTime<Utc>>,
}
