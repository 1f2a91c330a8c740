use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Cell;

/// System-generated identifier of a dimension version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurrogateKey(pub i64);

impl fmt::Display for SurrogateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One historical version of a business key, valid over `[valid_from, valid_to)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionVersion {
    pub entity: String,
    pub business_key: String,
    pub surrogate_key: SurrogateKey,
    pub attributes: BTreeMap<String, Cell>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub is_current: bool,
}

impl DimensionVersion {
    /// Returns `true` when `at` falls inside the half-open validity interval.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_to.is_none_or(|valid_to| at < valid_to)
    }
}

/// A mutation computed by a snapshot pass. A pass is applied as one atomic unit.
#[derive(Debug, Clone, PartialEq)]
pub enum DimensionChange {
    /// Opens the first version of a key, or reopens a key that had been closed.
    Open {
        business_key: String,
        attributes: BTreeMap<String, Cell>,
        valid_from: DateTime<Utc>,
    },
    /// Closes the current version of a key without a replacement.
    Close {
        business_key: String,
        surrogate_key: SurrogateKey,
        valid_to: DateTime<Utc>,
    },
    /// Closes the current version and opens its successor at the same instant.
    Replace {
        business_key: String,
        surrogate_key: SurrogateKey,
        attributes: BTreeMap<String, Cell>,
        at: DateTime<Utc>,
    },
}

impl DimensionChange {
    pub fn business_key(&self) -> &str {
        match self {
            DimensionChange::Open { business_key, .. }
            | DimensionChange::Close { business_key, .. }
            | DimensionChange::Replace { business_key, .. } => business_key,
        }
    }
}
