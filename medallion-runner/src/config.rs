use std::path::Path;

use anyhow::Context;
use medallion_config::shared::RunnerConfig;
use medallion_config::{Environment, load_config, load_config_from};

/// Loads and validates the runner configuration, from `config_dir` when given.
pub fn load_runner_config(config_dir: Option<&Path>) -> anyhow::Result<RunnerConfig> {
    let config: RunnerConfig = match config_dir {
        Some(dir) => load_config_from(dir, Environment::load()?)?,
        None => load_config()?,
    };
    config
        .validate()
        .context("invalid runner configuration")?;

    Ok(config)
}
