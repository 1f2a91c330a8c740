use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Batching configuration for the change event consumer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Number of buffered events that triggers a flush.
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,
    /// Maximum time, in milliseconds, the oldest buffered event may wait before a flush.
    #[serde(default = "default_batch_max_fill_ms")]
    pub max_fill_ms: u64,
    /// Hard ceiling of events held in memory per partition, sealed and open combined.
    ///
    /// Once reached the consumer stops pulling from the source until a flush succeeds.
    #[serde(default = "default_batch_max_buffered_events")]
    pub max_buffered_events: usize,
}

impl BatchConfig {
    pub const DEFAULT_MAX_SIZE: usize = 1000;

    pub const DEFAULT_MAX_FILL_MS: u64 = 1000;

    pub const DEFAULT_MAX_BUFFERED_EVENTS: usize = 10_000;

    /// Returns the linger interval as a [`Duration`].
    pub fn max_fill(&self) -> Duration {
        Duration::from_millis(self.max_fill_ms)
    }

    /// Validates batch configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_size == 0 {
            return Err(ValidationError::invalid(
                "batch.max_size",
                "must be greater than 0",
            ));
        }

        if self.max_fill_ms == 0 {
            return Err(ValidationError::invalid(
                "batch.max_fill_ms",
                "must be greater than 0",
            ));
        }

        if self.max_buffered_events < self.max_size {
            return Err(ValidationError::invalid(
                "batch.max_buffered_events",
                "must be greater than or equal to `batch.max_size`",
            ));
        }

        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_batch_max_size(),
            max_fill_ms: default_batch_max_fill_ms(),
            max_buffered_events: default_batch_max_buffered_events(),
        }
    }
}

fn default_batch_max_size() -> usize {
    BatchConfig::DEFAULT_MAX_SIZE
}

fn default_batch_max_fill_ms() -> u64 {
    BatchConfig::DEFAULT_MAX_FILL_MS
}

fn default_batch_max_buffered_events() -> usize {
    BatchConfig::DEFAULT_MAX_BUFFERED_EVENTS
}
