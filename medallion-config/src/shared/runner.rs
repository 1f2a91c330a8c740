use serde::Deserialize;

use crate::Config;
use crate::shared::{
    PipelineConfig, SourceConfig, StagingConfig, ValidationError, WarehouseConfig,
    WatermarkStoreConfig,
};

/// Complete configuration of the medallion runner.
///
/// This intentionally does not implement `Serialize` to avoid accidentally
/// leaking secrets in the config into serialized forms.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    pub pipeline: PipelineConfig,
    /// Change event source, only needed by the `consume` command.
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub watermark_store: WatermarkStoreConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.pipeline.validate()?;
        self.warehouse.validate()?;

        if matches!(self.watermark_store, WatermarkStoreConfig::Postgres)
            && matches!(self.warehouse, WarehouseConfig::Memory)
        {
            return Err(ValidationError::invalid(
                "watermark_store",
                "`postgres` requires a `postgres` warehouse",
            ));
        }

        Ok(())
    }
}

impl Config for RunnerConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["pipeline.partitions"];
}
