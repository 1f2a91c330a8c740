//! Medallion pipeline runner.
//!
//! Loads the layered configuration, initializes telemetry and runs one pipeline command against
//! the configured stores.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use medallion_telemetry::metrics::init_metrics;
use medallion_telemetry::tracing::init_tracing;
use tracing::{error, info};

use crate::config::load_runner_config;
use crate::core::run_command;

mod config;
mod core;
mod stores;

#[derive(Debug, Parser)]
#[command(name = "medallion", version, about = "Runs medallion pipeline stages")]
struct Cli {
    /// Directory holding `base.yaml` and the environment overrides. Defaults to
    /// `./configuration`.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Consumes every configured partition into the staging store until interrupted.
    Consume,
    /// Consumes, then periodically loads, merges and snapshots every configured dimension
    /// until interrupted.
    Run {
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },
    /// Loads staged objects that were not loaded yet into raw records.
    Load,
    /// Merges raw records of an entity into its conformed records.
    Merge {
        #[arg(long)]
        entity: String,
        /// Merges a single window after this load sequence instead of catching up from the
        /// stored watermark.
        #[arg(long)]
        since: Option<u64>,
    },
    /// Historizes the conformed records of an entity into dimension versions.
    Snapshot {
        #[arg(long)]
        entity: String,
        /// Effective time of the snapshot, RFC 3339. Defaults to now.
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },
    /// Merges newline-delimited JSON fact source records into a fact table.
    Facts {
        #[arg(long)]
        table: String,
        #[arg(long)]
        input: PathBuf,
    },
    /// Applies the warehouse migrations.
    Migrate,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_runner_config(cli.config_dir.as_deref())?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config, cli.command))
}

async fn async_main(
    config: medallion_config::shared::RunnerConfig,
    command: Command,
) -> anyhow::Result<()> {
    if matches!(command, Command::Consume | Command::Run { .. }) {
        init_metrics(config.pipeline.id)?;
    }

    info!(pipeline_id = config.pipeline.id, ?command, "running command");
    if let Err(err) = run_command(config, command).await {
        error!("{err:#}");
        return Err(err);
    }

    Ok(())
}
