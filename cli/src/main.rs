//! TzeIndex CLI: run the ingestion pipeline and inspect indexer state.
//!
//! # Commands
//! ```text
//! tzeindex run     [--config tzeindex.yaml] [--rpc-url URL] [--db PATH]
//!                  [--start-height N] [--stop-height N]
//! tzeindex status  --db PATH
//! tzeindex info
//! tzeindex version
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use tzeindex_core::{IndexModule, IndexStore, IndexerConfig, IndexerState};
use tzeindex_storage::{MemoryStorage, SqliteStorage};
use tzeindex_zcash::{HttpNodeClient, IndexerBuilder, NodeConfig};

mod logging;
mod settings;

use settings::{Settings, StorageBackend, StorageSettings};

#[derive(Parser)]
#[command(
    name = "tzeindex",
    about = "Zcash TZE block indexer",
    long_about = "
TzeIndex: ingest Zcash blocks from a full node, rebuild the transparent
UTXO graph, and track STARK-verification extension chains.

ENVIRONMENT VARIABLES:
  TZEINDEX_RPC_USER       Node RPC user
  TZEINDEX_RPC_PASSWORD   Node RPC password
  RUST_LOG                Log filter (overrides the settings file)
",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index blocks from the node until the stop height or Ctrl-C
    Run {
        /// YAML settings file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Node JSON-RPC endpoint
        #[arg(long)]
        rpc_url: Option<String>,
        #[arg(long, env = "TZEINDEX_RPC_USER")]
        rpc_user: Option<String>,
        #[arg(long, env = "TZEINDEX_RPC_PASSWORD", hide_env_values = true)]
        rpc_password: Option<String>,
        /// SQLite database path
        #[arg(long)]
        db: Option<String>,
        /// Start here instead of after the stored cursor
        #[arg(long)]
        start_height: Option<u64>,
        /// Exit after indexing this height
        #[arg(long)]
        stop_height: Option<u64>,
    },

    /// Print the cursor stored in a database
    Status {
        #[arg(long, default_value = "tzeindex.db")]
        db: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show default configuration
    Info,

    /// Print version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            rpc_url,
            rpc_user,
            rpc_password,
            db,
            start_height,
            stop_height,
        } => {
            let mut settings = Settings::load(config.as_deref())?;
            if let Some(url) = rpc_url {
                settings.node.url = url;
            }
            if rpc_user.is_some() {
                settings.node.user = rpc_user;
            }
            if rpc_password.is_some() {
                settings.node.password = rpc_password;
            }
            if let Some(path) = db {
                settings.storage.backend = StorageBackend::Sqlite;
                settings.storage.path = path;
            }
            if start_height.is_some() {
                settings.indexer.start_height = start_height;
            }
            if stop_height.is_some() {
                settings.indexer.stop_height = stop_height;
            }
            logging::init_tracing(&settings.log);
            cmd_run(settings).await
        }
        Commands::Status { db, json } => cmd_status(&db, json).await,
        Commands::Info => {
            cmd_info();
            Ok(())
        }
        Commands::Version => {
            println!("tzeindex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn open_store(settings: &StorageSettings) -> Result<Arc<dyn IndexStore>> {
    Ok(match settings.backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        StorageBackend::Sqlite => Arc::new(
            SqliteStorage::open(&settings.path)
                .await
                .with_context(|| format!("opening database {}", settings.path))?,
        ),
    })
}

async fn cmd_run(settings: Settings) -> Result<()> {
    let store = open_store(&settings.storage).await?;
    let client = Arc::new(HttpNodeClient::new(settings.node.clone())?);
    info!(
        node = %client.url(),
        backend = ?settings.storage.backend,
        indexer = %settings.indexer.id,
        "tzeindex starting"
    );

    let handle = IndexerBuilder::from_config(settings.indexer)
        .build(client, store)
        .spawn();
    let mut states = handle.subscribe();

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "cannot listen for Ctrl-C, stopping");
            } else {
                info!("interrupt received, stopping");
            }
            handle.stop();
        }
        _ = states.wait_for(|s| matches!(s, IndexerState::Stopped | IndexerState::Error)) => {}
    }

    handle.wait().await.context("indexer stopped with an error")?;
    info!("tzeindex stopped");
    Ok(())
}

async fn cmd_status(db: &str, json: bool) -> Result<()> {
    let store = SqliteStorage::open(db)
        .await
        .with_context(|| format!("opening database {db}"))?;
    let cursor = store.load_cursor().await?;
    let blocks = store.block_count().await?;

    if json {
        let out = serde_json::json!({ "cursor": cursor, "blocks": blocks });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    match cursor {
        Some(c) => {
            println!("Cursor:   height {} ({})", c.height, c.hash);
            println!("Updated:  {}", c.updated_at);
            println!("Blocks:   {blocks}");
        }
        None => println!("No blocks indexed yet ({db})"),
    }
    Ok(())
}

fn cmd_info() {
    let config = IndexerConfig::default();
    println!("TzeIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default node endpoint: {}", NodeConfig::default().url);
    println!("  Default batch size: {} blocks", config.batch_size);
    println!("  Default poll interval: {} ms", config.poll_interval_ms);
    println!(
        "  Default retries per block: {} (backoff {}..{} ms)",
        config.retry.max_retries, config.retry.initial_backoff_ms, config.retry.max_backoff_ms
    );
    println!("  Default max reorg depth: {} blocks", config.reorg.max_depth);
    println!(
        "  Max precondition size: {} bytes",
        config.max_precondition_size
    );
    let modules: Vec<String> = IndexModule::ALL.iter().map(|m| m.to_string()).collect();
    println!("  Modules: {}", modules.join(", "));
    println!("  Storage backends: memory, SQLite");
}
