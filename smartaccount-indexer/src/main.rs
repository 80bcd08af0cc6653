//! Smart-account indexer CLI.
//!
//! Indexes `AccountCreated` events from a smart-account factory and the
//! `TransactionExecuted` / `SmartAccountInitialized` events of every
//! account it deploys, maintaining a derived-state snapshot on disk.
//!
//! # Usage
//!
//! ```bash
//! # One-shot catch-up from the cursor (or the deployment block)
//! smartaccount-indexer sync --config config.toml
//!
//! # Follow the chain continuously
//! smartaccount-indexer watch --config config.toml
//!
//! # Catch up through a specific RPC endpoint
//! smartaccount-indexer sync --config config.toml --rpc https://my-rpc.example.com
//!
//! # Inspect the derived state
//! smartaccount-indexer status --config config.toml
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use smartaccount::{Account, EntityId, Factory, Transaction};
use smartaccount_indexer::config::Config;
use smartaccount_indexer::cursor::Cursor;
use smartaccount_indexer::fetcher;
use smartaccount_indexer::handlers::Indexer;

/// Smart-account factory event indexer.
#[derive(Debug, Parser)]
#[command(name = "smartaccount-indexer", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Catch up from the cursor to the confirmed head, then exit.
    Sync {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,

        /// Override the configured RPC endpoint list with a single URL.
        #[arg(long)]
        rpc: Option<String>,

        /// Replay from this block instead of the cursor. The handlers are
        /// idempotent, so replaying an already-indexed range is safe.
        #[arg(long)]
        from_block: Option<u64>,
    },

    /// Follow the chain continuously, catching up on every poll.
    Watch {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,

        /// Override the configured RPC endpoint list with a single URL.
        #[arg(long)]
        rpc: Option<String>,
    },

    /// Print derived-state counts from the snapshot.
    Status {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Sync {
            config,
            rpc,
            from_block,
        } => cmd_sync(&config, rpc, from_block).await,
        Command::Watch { config, rpc } => cmd_watch(&config, rpc).await,
        Command::Status { config } => cmd_status(&config),
    }
}

/// Load the config, applying CLI overrides.
fn load_config(path: &Path, rpc_override: Option<String>) -> Result<Config> {
    let mut config = Config::load(path)?;
    if let Some(rpc) = rpc_override {
        config.rpcs = vec![rpc];
    }
    config.validate()?;
    Ok(config)
}

/// Restore the indexer from the state snapshot, or start fresh.
fn load_indexer(config: &Config) -> Result<Indexer> {
    Indexer::restore_or_new(&config.state_path(), config.factory)
        .with_context(|| format!("restoring state from {}", config.state_path().display()))
}

/// Execute the `sync` subcommand.
async fn cmd_sync(config: &Path, rpc: Option<String>, from_block: Option<u64>) -> Result<()> {
    let mut config = load_config(config, rpc)?;
    if let Some(block) = from_block {
        // Rewind the recorded progress so the pass replays from `block`.
        config.deployment_block = block;
        if block == 0 {
            let path = config.data_dir.join("cursor.json");
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("removing {}", path.display()))?;
            }
        } else {
            let factory_id = EntityId::from_address(config.factory);
            Cursor::now(factory_id, block - 1).save(&config.data_dir)?;
        }
    }

    let mut indexer = load_indexer(&config)?;
    fetcher::sync_once(&config, &mut indexer).await
}

/// Execute the `watch` subcommand.
async fn cmd_watch(config: &Path, rpc: Option<String>) -> Result<()> {
    let config = load_config(config, rpc)?;
    let mut indexer = load_indexer(&config)?;
    fetcher::watch(&config, &mut indexer).await
}

/// Execute the `status` subcommand.
#[allow(clippy::print_stdout, reason = "status output is the command's purpose")]
fn cmd_status(config: &Path) -> Result<()> {
    let config = Config::load(config)?;
    let factory_id = EntityId::from_address(config.factory);

    let Some(indexer) = Indexer::restore(&config.state_path(), config.factory)? else {
        println!("no state snapshot at {}", config.state_path().display());
        return Ok(());
    };

    let store = indexer.store();
    let stats = indexer.stats();

    println!("factory        {factory_id}");
    match Cursor::load(&config.data_dir, factory_id)? {
        Some(cursor) => println!("synced to      block {}", cursor.last_block),
        None => println!("synced to      (no cursor)"),
    }
    println!("factories      {}", store.count::<Factory>());
    println!("accounts       {}", store.count::<Account>());
    println!("transactions   {}", store.count::<Transaction>());
    println!("events applied {}", stats.applied);
    println!(
        "duplicates     {} creations, {} transactions, {} initializations",
        stats.duplicate_creations, stats.duplicate_transactions, stats.duplicate_initializations
    );
    println!(
        "dropped        {} unknown source, {} unroutable, {} missing account",
        stats.dropped_unknown_source, stats.dropped_unroutable, stats.dropped_missing_account
    );

    Ok(())
}
