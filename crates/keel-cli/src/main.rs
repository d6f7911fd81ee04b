//! Keel CLI - plugin host operator tool.
//!
//! Every command opens the configured repository, info store, package cache
//! and lock cache directly. `keel run` is the long-running host: it scans,
//! restores enabled plugins and keeps reconciling until interrupted.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod commands;
mod config_bridge;
mod theme;

use commands::{plugin, run};

/// Keel - isolated plugin host
#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "KEEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile with the repository and print what changed
    Scan,

    /// List known plugins
    List {
        /// Only show enabled plugins
        #[arg(long)]
        enabled: bool,
    },

    /// Upload a package file and register it
    Upload {
        /// Path to the `.pkg` file
        file: PathBuf,

        /// Enable the plugin right after registering it
        #[arg(long)]
        enable: bool,
    },

    /// Print the metadata of a package (`outer.pkg!/lib/inner.pkg` for nested packages)
    Inspect {
        /// Package locator
        locator: String,
    },

    /// Reconcile a single repository path
    Refresh {
        /// Repository path, e.g. `plugins/foo.pkg`
        path: String,
    },

    /// Remove a plugin and its remote artifact
    Remove {
        /// Plugin ID
        id: String,
    },

    /// Enable a plugin and print its descriptor
    Enable {
        /// Plugin ID
        id: String,
    },

    /// Disable a plugin
    Disable {
        /// Plugin ID
        id: String,
    },

    /// Run the plugin host until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let resolved = keel_config::Config::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    let config = resolved.config;

    // Set up logging from config, with --verbose override.
    let mut log_config = config_bridge::to_log_config(&config)?;
    if cli.verbose {
        "debug".clone_into(&mut log_config.level);
    }
    if let Err(e) = keel_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }
    for file in &resolved.loaded_files {
        tracing::debug!(file = %file, "loaded config file");
    }

    match cli.command {
        Commands::Scan => plugin::scan(&config).await?,
        Commands::List { enabled } => plugin::list(&config, enabled).await?,
        Commands::Upload { file, enable } => plugin::upload(&config, &file, enable).await?,
        Commands::Inspect { locator } => plugin::inspect(&locator).await?,
        Commands::Refresh { path } => plugin::refresh(&config, &path).await?,
        Commands::Remove { id } => plugin::remove(&config, &id).await?,
        Commands::Enable { id } => plugin::enable(&config, &id).await?,
        Commands::Disable { id } => plugin::disable(&config, &id).await?,
        Commands::Run => run::run_host(&config).await?,
    }

    Ok(())
}
