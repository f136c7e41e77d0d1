//! # objsync-cli
//!
//! Read-only inspection of an objsync store.
//!
//! ## Commands
//!
//! - `status`: Row counts per kind
//! - `objects`: Objects and their files
//! - `needs-download`: Files with a newer server version nobody is fetching
//! - `trackers`: Queued and in-flight transfers
//!
//! ## Example
//!
//! ```bash
//! objsync --db ~/app/objsync.db status
//! objsync trackers --json
//! RUST_LOG=debug objsync objects --deleted
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod store;

use commands::{needs_download, objects, status, trackers};

/// Inspect an objsync store.
#[derive(Parser, Debug)]
#[command(name = "objsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Store database (default: objsync.db in the data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show row counts per kind
    Status,

    /// List objects and their files
    Objects {
        /// Include objects deleted locally or on the server
        #[arg(long)]
        deleted: bool,
    },

    /// List files with a newer server version that are not queued
    NeedsDownload,

    /// List queued and in-flight transfers
    Trackers,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let db = match cli.db {
        Some(path) => path,
        None => default_db()?,
    };
    let store = store::open(&db).await?;

    match cli.command {
        Commands::Status => status::run(&store, &db, cli.json).await?,
        Commands::Objects { deleted } => objects::run(&store, deleted, cli.json).await?,
        Commands::NeedsDownload => needs_download::run(&store, cli.json).await?,
        Commands::Trackers => trackers::run(&store, cli.json).await?,
    }

    Ok(())
}

/// Get the default store path.
fn default_db() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "objsync", "objsync")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().join(store::DEFAULT_DB))
}
