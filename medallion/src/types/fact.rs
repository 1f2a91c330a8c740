use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Cell, SurrogateKey};

/// A dimension key referenced by a fact source record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionReference {
    /// Name under which the resolved surrogate key is stored on the fact, e.g. `customer`.
    pub role: String,
    /// Dimension entity the business key belongs to.
    pub entity: String,
    pub business_key: String,
    /// Unresolvable required references quarantine the record; optional ones are left unset.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Input of the fact merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactSource {
    pub natural_key: String,
    /// Business time of the fact, used for point-in-time dimension resolution.
    pub event_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub measures: BTreeMap<String, Cell>,
    #[serde(default)]
    pub references: Vec<DimensionReference>,
}

/// A fact row, unique by `natural_key` within its fact table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub fact_table: String,
    pub natural_key: String,
    /// Resolved surrogate keys by reference role.
    pub dimension_keys: BTreeMap<String, SurrogateKey>,
    pub measures: BTreeMap<String, Cell>,
    pub event_timestamp: DateTime<Utc>,
}
