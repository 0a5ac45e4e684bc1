//! tabsync CLI
//!
//! Command-line tools for file-backed tabsync stores.
//!
//! # Commands
//!
//! - `inspect` - Display revision, change log and node registry state
//! - `changes` - Dump change records
//! - `put` / `delete` - Write tracked mutations
//! - `watch` - Join the store as a live node and print what it sees

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// tabsync command-line store tools.
#[derive(Parser)]
#[command(name = "tabsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display revision, change log and node registry state
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump change records
    Changes {
        /// Only show records after this revision
        #[arg(short, long, default_value = "0")]
        since: u64,

        /// Maximum number of records to show
        #[arg(short, long, default_value = "100")]
        limit: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Create or replace a row
    Put {
        /// Table name
        #[arg(short, long)]
        table: String,

        /// Row key (JSON, or plain text)
        #[arg(short, long)]
        key: String,

        /// Row value (JSON)
        #[arg(long)]
        value: String,

        /// Source tag recorded on the change
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Delete a row
    Delete {
        /// Table name
        #[arg(short, long)]
        table: String,

        /// Row key (JSON, or plain text)
        #[arg(short, long)]
        key: String,

        /// Source tag recorded on the change
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Join the store as a live node and print delivered changes
    Watch {
        /// Stop after this many seconds (runs until Ctrl-C if omitted)
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Changes {
            since,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for changes")?;
            commands::changes::run(&path, since, limit, &format)?;
        }
        Commands::Put {
            table,
            key,
            value,
            source,
        } => {
            let path = cli.path.ok_or("Store path required for put")?;
            commands::write::put(&path, &table, &key, &value, source.as_deref())?;
        }
        Commands::Delete { table, key, source } => {
            let path = cli.path.ok_or("Store path required for delete")?;
            commands::write::delete(&path, &table, &key, source.as_deref())?;
        }
        Commands::Watch { seconds } => {
            let path = cli.path.ok_or("Store path required for watch")?;
            commands::watch::run(&path, seconds)?;
        }
        Commands::Version => {
            println!("tabsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
