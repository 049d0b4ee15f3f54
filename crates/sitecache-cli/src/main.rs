//! sitecache - command-line host for the offline worker.
//!
//! Each invocation loads the cache snapshot, runs one command against a
//! worker for the configured site, and writes the snapshot back.

mod args;
mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use sitecache_common::{init_logging, LogConfig};
use sitecache_sw::WorkerConfig;
use tracing::debug;

use crate::args::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format));

    let config = load_config(&cli)?;
    let store = cli.store.clone().unwrap_or_else(default_store_path);
    debug!(store = %store.display(), version = %config.version, "Starting");

    let host = commands::Host::open(config, store).await?;
    match cli.command {
        Commands::Install(args) => commands::install(host, args).await,
        Commands::Fetch(args) => commands::fetch(host, args).await,
        Commands::Cleanup => commands::cleanup(host).await,
        Commands::Status => commands::status(host).await,
        Commands::Push(args) => commands::push(host, args).await,
    }
}

fn load_config(cli: &Cli) -> Result<WorkerConfig> {
    let mut config = match &cli.config {
        Some(path) => WorkerConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    if let Some(origin) = &cli.origin {
        config.origin = origin.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn default_store_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sitecache")
        .join("caches.json")
}
