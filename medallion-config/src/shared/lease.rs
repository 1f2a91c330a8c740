use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Exclusive lease settings shared by every stage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LeaseConfig {
    /// Time after which an unreleased lease is considered abandoned, in milliseconds.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// How long to keep trying to acquire a held lease before giving up, in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_ttl_ms() -> u64 {
    5 * 60 * 1000
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.ttl_ms == 0 {
            return Err(ValidationError::invalid(
                "lease.ttl_ms",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}
