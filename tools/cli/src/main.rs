//! Offsync CLI - Command line interface for the offline engine.
//!
//! This tool drives a local offline database: queueing mutations, running
//! sync passes, inspecting the mirror and cache tables.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

use offsync_common::MutationId;
use offsync_storage::{EntitySyncStatus, HttpMethod};
use offsync_sync::{
    ManualReachability, MockTransport, OfflineConfig, OfflineEngine, SyncOutcome, Transport,
};

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "Offsync - Offline-first data sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file (overrides the configuration).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Base URL for relative endpoints (overrides the configuration).
    #[arg(long)]
    base_url: Option<Url>,

    /// Treat the network as unreachable.
    #[arg(long)]
    offline: bool,

    /// Accept every mutation locally instead of contacting the server.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a mutation for the remote service.
    Enqueue {
        /// Endpoint path or absolute URL.
        #[arg(short, long)]
        endpoint: String,

        /// HTTP method: GET, POST, PUT, PATCH or DELETE.
        #[arg(short, long, default_value = "POST")]
        method: String,

        /// JSON payload.
        #[arg(short, long, default_value = "null")]
        payload: String,
    },

    /// List pending mutations.
    Pending,

    /// List permanently failed mutations.
    Failed,

    /// Give a failed mutation a fresh retry budget.
    RetryFailed {
        /// Mutation id.
        #[arg(short, long)]
        id: String,
    },

    /// Delete synced mutations.
    Purge,

    /// Run one sync pass.
    Sync,

    /// Show queue, cache and mirror statistics.
    Stats,

    /// Store a record in an entity-mirror table.
    Store {
        /// Table name.
        #[arg(short, long)]
        table: String,

        /// Record id.
        #[arg(short, long)]
        id: String,

        /// JSON payload.
        #[arg(short, long)]
        payload: String,
    },

    /// Read one record, or the whole table without --id.
    Get {
        /// Table name.
        #[arg(short, long)]
        table: String,

        /// Record id.
        #[arg(short, long)]
        id: Option<String>,
    },

    /// Delete a record from an entity-mirror table.
    Remove {
        /// Table name.
        #[arg(short, long)]
        table: String,

        /// Record id.
        #[arg(short, long)]
        id: String,
    },

    /// Set the sync status of a mirrored record.
    MarkStatus {
        /// Table name.
        #[arg(short, long)]
        table: String,

        /// Record id.
        #[arg(short, long)]
        id: String,

        /// Status: pending, synced or conflict.
        #[arg(short, long)]
        status: String,
    },

    /// Response cache operations.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Cache a JSON response.
    Put {
        #[arg(short, long)]
        key: String,

        /// JSON value.
        #[arg(short, long)]
        value: String,

        /// Time to live in minutes.
        #[arg(short, long, default_value = "60")]
        ttl: u32,
    },

    /// Read a fresh cached response.
    Get {
        #[arg(short, long)]
        key: String,
    },

    /// Drop one cached response.
    Invalidate {
        #[arg(short, long)]
        key: String,
    },

    /// Delete every expired entry.
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let engine = open_engine(&cli).await?;
    let result = run_command(&engine, cli.command).await;
    engine.cleanup().await;
    result
}

/// Load configuration and apply command-line overrides.
fn load_config(cli: &Cli) -> Result<OfflineConfig> {
    let mut config = match &cli.config {
        Some(path) => read_config(path)?,
        None => OfflineConfig::default(),
    };

    if let Some(db) = &cli.db {
        config.database_path = Some(db.clone());
    }
    if config.database_path.is_none() {
        config.database_path = Some(default_database_path()?);
    }
    if let Some(base_url) = &cli.base_url {
        config.base_url = Some(base_url.clone());
    }

    // Passes only run when asked for.
    Ok(config.with_sync_on_start(false))
}

fn read_config(path: &Path) -> Result<OfflineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

fn default_database_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().context("No data directory on this platform")?;
    Ok(data_dir.join("offsync").join("offline.db"))
}

async fn open_engine(cli: &Cli) -> Result<OfflineEngine> {
    let config = load_config(cli)?;
    let reachability = Arc::new(ManualReachability::new(!cli.offline));

    let engine = if cli.dry_run {
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::new());
        OfflineEngine::new(config, transport, reachability)
    } else {
        OfflineEngine::with_http(config, reachability).context("Failed to create HTTP transport")?
    };

    if let Some(path) = &engine.config().database_path {
        info!("Using database {}", path.display());
    }
    if !engine.initialize().await {
        anyhow::bail!("Failed to initialize the offline engine");
    }
    Ok(engine)
}

fn parse_json(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON: {}", raw))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_command(engine: &OfflineEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Enqueue {
            endpoint,
            method,
            payload,
        } => cmd_enqueue(engine, &endpoint, &method, &payload).await,

        Commands::Pending => {
            let pending = engine
                .pending_actions()
                .await
                .context("Failed to list pending mutations")?;
            print_json(&pending)
        }

        Commands::Failed => {
            let failed = engine
                .failed_actions()
                .await
                .context("Failed to list failed mutations")?;
            print_json(&failed)
        }

        Commands::RetryFailed { id } => {
            let id = MutationId::new(id).context("Invalid mutation id")?;
            if engine.retry_failed_action(&id).await {
                println!("Mutation {} queued for retry", id);
            } else {
                println!("No failed mutation {}", id);
            }
            Ok(())
        }

        Commands::Purge => {
            let purged = engine
                .purge_synced_actions()
                .await
                .context("Failed to purge synced mutations")?;
            println!("Purged {} synced mutations", purged);
            Ok(())
        }

        Commands::Sync => cmd_sync(engine).await,

        Commands::Stats => {
            let stats = engine
                .get_offline_stats()
                .await
                .context("Failed to collect statistics")?;
            print_json(&stats)
        }

        Commands::Store { table, id, payload } => {
            let payload = parse_json(&payload)?;
            if !engine.store_data(&table, &id, payload).await {
                anyhow::bail!("Failed to store {}/{}", table, id);
            }
            println!("Stored {}/{}", table, id);
            Ok(())
        }

        Commands::Get { table, id } => match id {
            Some(id) => match engine.get_data(&table, &id).await {
                Some(record) => print_json(&record),
                None => {
                    println!("No record {}/{}", table, id);
                    Ok(())
                }
            },
            None => {
                let records = engine
                    .get_all_data(&table)
                    .await
                    .with_context(|| format!("Failed to read table {}", table))?;
                print_json(&records)
            }
        },

        Commands::Remove { table, id } => {
            if engine.remove_data(&table, &id).await {
                println!("Removed {}/{}", table, id);
            } else {
                println!("No record {}/{}", table, id);
            }
            Ok(())
        }

        Commands::MarkStatus { table, id, status } => {
            let status: EntitySyncStatus = status.parse().context("Invalid status")?;
            if !engine.mark_data_status(&table, &id, status).await {
                anyhow::bail!("No record {}/{}", table, id);
            }
            println!("Marked {}/{} as {}", table, id, status);
            Ok(())
        }

        Commands::Cache { command } => cmd_cache(engine, command).await,
    }
}

/// Queue a mutation.
async fn cmd_enqueue(engine: &OfflineEngine, endpoint: &str, method: &str, payload: &str) -> Result<()> {
    let method: HttpMethod = method.parse().context("Invalid HTTP method")?;
    let payload = parse_json(payload)?;

    let mutation = engine
        .queue_action(endpoint, method, payload)
        .await
        .context("Failed to queue mutation")?;

    println!("Queued {} {} as {}", mutation.method, mutation.endpoint, mutation.id);
    Ok(())
}

/// Run one sync pass and print its report.
async fn cmd_sync(engine: &OfflineEngine) -> Result<()> {
    let outcome = engine
        .sync_data()
        .await
        .context("Sync pass failed")?;

    match outcome {
        SyncOutcome::Completed(report) => {
            println!(
                "Sync finished: {} attempted, {} synced, {} failed ({} permanently)",
                report.attempted, report.synced, report.failed, report.permanently_failed
            );
            if report.interrupted {
                println!("Pass interrupted by loss of connectivity");
            }
        }
        SyncOutcome::AlreadyRunning => println!("A sync pass is already running"),
        SyncOutcome::Offline => println!("Offline; nothing sent"),
    }

    Ok(())
}

async fn cmd_cache(engine: &OfflineEngine, command: CacheCommands) -> Result<()> {
    match command {
        CacheCommands::Put { key, value, ttl } => {
            let value = parse_json(&value)?;
            if !engine.cache_response(&key, &value, ttl).await {
                anyhow::bail!("Failed to cache {}", key);
            }
            println!("Cached {} for {} minutes", key, ttl);
        }
        CacheCommands::Get { key } => match engine.get_cached_response(&key).await {
            Some(value) => print_json(&value)?,
            None => println!("No fresh entry for {}", key),
        },
        CacheCommands::Invalidate { key } => {
            if engine.invalidate_cached_response(&key).await {
                println!("Invalidated {}", key);
            } else {
                println!("No entry for {}", key);
            }
        }
        CacheCommands::Clear => {
            let cleared = engine
                .clear_expired_cache()
                .await
                .context("Failed to clear expired cache entries")?;
            println!("Cleared {} expired entries", cleared);
        }
    }
    Ok(())
}
