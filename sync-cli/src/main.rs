//! # chatsync
//!
//! Operator CLI for the chatsync local store.
//!
//! ## Commands
//!
//! - `status`: Show row counts, WAL size, and degraded state
//! - `outbox`: List queued sends
//! - `checkpoint`: Checkpoint the write-ahead log
//! - `demo`: Run the engine against an in-memory backend
//!
//! ## Example
//!
//! ```bash
//! # Inspect a store
//! chatsync --db chat.db status
//!
//! # Fold the WAL back into the database
//! chatsync --db chat.db checkpoint --force
//!
//! # Watch an offline send get delivered
//! chatsync demo --messages 3
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{checkpoint, demo, outbox, status};

/// Operator CLI for the chatsync local store.
#[derive(Parser, Debug)]
#[command(name = "chatsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Database file (overrides `[store] database` from the config file)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (ignores RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show store statistics
    Status,

    /// List queued sends
    Outbox,

    /// Checkpoint the write-ahead log
    Checkpoint {
        /// Block writers and truncate the log
        #[arg(long)]
        force: bool,
    },

    /// Send while offline, reconnect, and show the result
    Demo {
        /// Group to chat in
        #[arg(long, default_value = "general")]
        group: String,

        /// Local user
        #[arg(long, default_value = "alice")]
        user: String,

        /// Messages to send while offline
        #[arg(long, default_value = "3")]
        messages: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = config::load(cli.config.as_deref(), cli.db)?;

    match cli.command {
        Commands::Status => status::run(&config).await?,
        Commands::Outbox => outbox::run(&config).await?,
        Commands::Checkpoint { force } => checkpoint::run(&config, force).await?,
        Commands::Demo {
            group,
            user,
            messages,
        } => demo::run(config, &group, &user, messages).await?,
    }

    Ok(())
}
