//! SedeSync CLI
//!
//! Operator commands for a SedeSync site.
//!
//! # Commands
//!
//! - `init` - Provision a site data directory
//! - `status` - Queue counts, conflicts and capture warnings
//! - `conflicts` - List open conflicts
//! - `resolve-conflict` - Resolve one conflict
//! - `push` / `pull` / `full-sync` / `retry-failed` - Sync with a hub directory
//! - `cleanup` - Delete SYNCED records past the retention horizon
//! - `dump-queue` - Print change records for debugging

mod commands;
mod error;
mod session;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// SedeSync site operations.
#[derive(Parser)]
#[command(name = "sedesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the site data directory
    #[arg(global = true, short, long)]
    data: Option<PathBuf>,

    /// Path to the hub data directory, for commands that talk to the hub
    #[arg(global = true, long)]
    hub: Option<PathBuf>,

    /// Output format (text, json)
    #[arg(global = true, short, long, default_value = "text")]
    format: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a site data directory
    Init {
        /// Site code (CENTRAL, NORTE, SUR, ORIENTE, OCCIDENTE)
        #[arg(short, long)]
        site: String,

        /// Display name
        #[arg(short, long)]
        name: String,
    },

    /// Show queue counts, conflicts and capture warnings
    Status,

    /// List open conflicts
    Conflicts,

    /// Resolve one conflict
    ResolveConflict {
        /// Conflict id
        id: String,

        /// keep-local, keep-remote or merged
        decision: String,

        /// Merged payload as a JSON object (with `merged`)
        #[arg(short, long)]
        merged: Option<String>,
    },

    /// Push PENDING records to the hub
    Push,

    /// Pull the hub's changes
    Pull {
        /// Only these tables (the watermark is left alone)
        #[arg(short, long, value_delimiter = ',')]
        tables: Option<Vec<String>>,

        /// Replay from this hub cursor instead of the watermark
        #[arg(short, long)]
        since: Option<u64>,
    },

    /// Reconcile tables against the hub's snapshot
    FullSync {
        /// Only these tables
        #[arg(short, long, value_delimiter = ',')]
        tables: Option<Vec<String>>,

        /// Delete local rows the hub no longer has
        #[arg(short, long)]
        remove_missing: bool,
    },

    /// Requeue FAILED records and push them again
    RetryFailed,

    /// Delete SYNCED records past the retention horizon
    Cleanup {
        /// Retention in days
        #[arg(short, long, default_value = "30")]
        retention_days: u64,
    },

    /// Dump change records for debugging
    DumpQueue {
        /// Only records with this status (pending, synced, failed)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of records to dump
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let format = cli.format.as_str();
    let hub = cli.hub.as_deref();

    if let Commands::Version = cli.command {
        println!("SedeSync CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let data = cli.data.ok_or("Site data path required (--data)")?;

    match cli.command {
        Commands::Init { site, name } => commands::init::run(&data, &site, &name, format)?,
        Commands::Status => commands::status::run(&data, hub, format)?,
        Commands::Conflicts => commands::conflicts::list(&data, format)?,
        Commands::ResolveConflict {
            id,
            decision,
            merged,
        } => commands::conflicts::resolve(&data, &id, &decision, merged.as_deref(), format)?,
        Commands::Push => commands::sync::push(&data, hub, format)?,
        Commands::Pull { tables, since } => commands::sync::pull(&data, hub, tables, since, format)?,
        Commands::FullSync {
            tables,
            remove_missing,
        } => commands::sync::full_sync(&data, hub, tables, remove_missing, format)?,
        Commands::RetryFailed => commands::sync::retry_failed(&data, hub, format)?,
        Commands::Cleanup { retention_days } => {
            commands::cleanup::run(&data, retention_days, format)?
        }
        Commands::DumpQueue { status, limit } => {
            commands::dump_queue::run(&data, status.as_deref(), limit, format)?
        }
        Commands::Version => {}
    }

    Ok(())
}
