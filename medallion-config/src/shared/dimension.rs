use serde::{Deserialize, Serialize};

/// Per-dimension snapshot settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DimensionConfig {
    /// Entity whose conformed records feed this dimension.
    pub entity: String,
    /// Attributes whose changes open a new dimension version.
    ///
    /// An empty list means every attribute is tracked.
    #[serde(default)]
    pub tracked_attributes: Vec<String>,
}

/// Ingestion contract for an entity's row images.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EntitySchemaConfig {
    pub entity: String,
    /// Schema version row images must declare.
    pub schema_version: u32,
    /// Fields every row image must carry.
    #[serde(default)]
    pub required_fields: Vec<String>,
}
