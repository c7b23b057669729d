//! Synchronizes the MARC projection of one deployment and exits.
//!
//! Configuration is loaded from the `configuration` directory and `APP_` environment variables,
//! command line flags override the synchronization settings for a single run.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::error;

use crate::config::load_syncer_config;
use crate::core::run_syncer;

mod config;
mod core;

/// Command line flags of a single synchronization run.
#[derive(Debug, Parser)]
#[command(name = "marct-syncer", version, about = "Maintains the flattened MARC projection")]
struct Cli {
    /// Rebuild the projection from scratch even when an incremental update is possible.
    #[arg(long)]
    full: bool,

    /// Write the projected rows to this file instead of the database.
    #[arg(long, value_name = "PATH")]
    output_file: Option<PathBuf>,

    /// Also create a trigram index on the content column.
    #[arg(long)]
    trigram_index: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_syncer_config()?;
    config.sync.force_full |= cli.full;
    config.sync.trigram_index |= cli.trigram_index;
    if cli.output_file.is_some() {
        config.sync.output_file = cli.output_file;
    }

    marct_telemetry::tracing::init_tracing(env!("CARGO_BIN_NAME"))
        .context("failed to initialize tracing")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;

    if let Err(err) = runtime.block_on(run_syncer(config)) {
        error!("{err:#}");
        return Err(err);
    }

    Ok(())
}
