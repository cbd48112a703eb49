//! Panorama operational binary
//!
//! Runs compaction against a filesystem bucket and inspects its blocks.
//!
//! # Configuration
//!
//! Read from (first match wins):
//! 1. `--config <path>`
//! 2. `PANORAMA_CONFIG` environment variable
//! 3. `./panorama.toml` in the current directory
//! 4. Defaults
//!
//! `PANORAMA_*` environment variables override individual values.
//!
//! # Example Usage
//!
//! ```bash
//! # One planning + execution pass, then exit
//! panorama --bucket-dir /data/bucket compact --once
//!
//! # Run the compactor until Ctrl+C / SIGTERM
//! panorama -c /etc/panorama.toml compact
//!
//! # Inspect blocks
//! panorama blocks list --format json
//! panorama blocks mark-delete 01HV3K0Q4J9W3Y2C2T4S0N6J8P
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use panorama_tsdb::{
    block,
    compact::CompactionService,
    config::ApplicationConfig,
    metastore::MetaStore,
    metrics,
    objstore::{LocalFsObjectStore, ObjectStore, RetryingObjectStore},
    services::{BucketSyncService, ServiceConfig, ServiceManager},
    types::now_ms,
};
use tokio::signal;
use tracing::{info, warn};
use ulid::Ulid;

// =============================================================================
// CLI Definition
// =============================================================================

/// Panorama - block compaction and replica deduplication for Prometheus-format data
#[derive(Parser)]
#[command(name = "panorama")]
#[command(version)]
#[command(about = "Block compaction and query federation for replicated time-series", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (overrides PANORAMA_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override bucket directory
    #[arg(short, long, global = true)]
    bucket_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print a summary
    CheckConfig,

    /// Run the compactor
    Compact {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Inspect and manage blocks
    Blocks {
        #[command(subcommand)]
        command: BlockCommands,
    },
}

#[derive(Subcommand)]
enum BlockCommands {
    /// List all blocks in the bucket
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Mark a block for deletion
    MarkDelete {
        /// Block ID
        id: String,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

// =============================================================================
// Setup
// =============================================================================

fn load_config(cli: &Cli) -> Result<ApplicationConfig, Box<dyn std::error::Error>> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("PANORAMA_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let local = PathBuf::from("panorama.toml");
            local.exists().then_some(local)
        });

    let mut config = match path {
        Some(path) => ApplicationConfig::from_file_with_env(&path.to_string_lossy())?,
        None => ApplicationConfig::from_env(),
    };
    if let Some(dir) = &cli.bucket_dir {
        config.storage.bucket_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &ApplicationConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitoring.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn open_bucket(config: &ApplicationConfig) -> Result<Arc<dyn ObjectStore>, Box<dyn std::error::Error>> {
    let local: Arc<dyn ObjectStore> = Arc::new(LocalFsObjectStore::new(config.storage.bucket_dir.clone())?);
    Ok(Arc::new(RetryingObjectStore::new(local, config.storage_retry_policy())))
}

/// Wait for Ctrl+C or SIGTERM
///
/// A handler that fails to install is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler installation failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "SIGTERM handler installation failed");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, starting graceful shutdown");
}

fn format_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ms.to_string())
}

// =============================================================================
// Command Handlers
// =============================================================================

fn cmd_check_config(config: &ApplicationConfig) -> CliResult {
    println!("Configuration is valid!");
    println!();
    println!("Query:");
    println!("  Replica labels: {}", config.query.replica_labels.join(", "));
    println!("  Dedup function: {}", config.query.dedup_function);
    println!("  Partial response: {}", config.query.partial_response);
    println!("  Timeout: {}s", config.query.query_timeout_secs);
    println!();
    println!("Store:");
    println!("  Max concurrent select: {}", config.store.max_concurrent_select);
    println!("  Per-provider timeout: {}ms", config.store.per_provider_timeout_ms);
    println!();
    println!("Compaction:");
    println!("  Interval: {}s", config.compaction.interval_secs);
    println!("  Block ranges (s): {:?}", config.compaction.block_ranges_secs);
    println!("  Downsampling: {}", config.compaction.downsampling_enabled);
    println!("  Max concurrent jobs: {}", config.compaction.max_concurrent_jobs);
    println!();
    println!("Storage:");
    println!("  Bucket directory: {:?}", config.storage.bucket_dir);
    Ok(())
}

async fn cmd_compact(config: &ApplicationConfig, once: bool) -> CliResult {
    let bucket = open_bucket(config)?;
    let metastore = Arc::new(MetaStore::new());
    let compactor = Arc::new(CompactionService::new(
        config.compaction_config(),
        metastore.clone(),
        bucket.clone(),
    ));

    if once {
        let synced = metastore.sync_from_bucket(bucket.as_ref()).await?;
        info!(blocks = synced.loaded, "Bucket loaded");

        let report = compactor.run_once().await;
        println!(
            "Compaction pass: {} planned, {} completed, {} failed, {} deferred, {} purged",
            report.planned,
            report.outputs.len(),
            report.failures.len(),
            report.rejected,
            report.purged
        );
        for (job_id, error) in &report.failures {
            println!("  job {}: {}", job_id, error);
        }
        for group in &report.halted {
            println!("  halted group: {}", group);
        }
        if !report.failures.is_empty() {
            return Err(format!("{} compaction job(s) failed", report.failures.len()).into());
        }
        return Ok(());
    }

    let manager = ServiceManager::new(ServiceConfig::default());
    manager.register(Arc::new(BucketSyncService::new(
        metastore,
        bucket,
        std::time::Duration::from_secs(config.storage.sync_interval_secs),
    )))?;
    manager.register(compactor.clone())?;
    manager.start_all().await?;

    shutdown_signal().await;
    manager.shutdown().await;

    let stats = compactor.stats();
    info!(
        cycles = stats.cycles,
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        purged = stats.blocks_purged,
        "Compactor stopped"
    );
    if config.monitoring.dump_metrics_on_exit {
        match metrics::gather_metrics() {
            Ok(text) => println!("{}", text),
            Err(e) => warn!(error = %e, "Failed to gather metrics"),
        }
    }
    Ok(())
}

async fn cmd_blocks_list(config: &ApplicationConfig, format: &str) -> CliResult {
    let bucket = open_bucket(config)?;
    let metastore = MetaStore::new();
    metastore.sync_from_bucket(bucket.as_ref()).await?;
    let blocks = metastore.all_blocks();

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&blocks)?);
        return Ok(());
    }

    println!(
        "{:<26}  {:<20}  {:<20}  {:<4}  {:<5}  {:<7}  LABELS",
        "ID", "MIN TIME", "MAX TIME", "RES", "LEVEL", "STATE"
    );
    for meta in &blocks {
        println!(
            "{:<26}  {:<20}  {:<20}  {:<4}  {:<5}  {:<7}  {}",
            meta.block_id,
            format_ms(meta.min_time),
            format_ms(meta.max_time),
            meta.resolution,
            meta.compaction_level,
            if meta.is_active() { "active" } else { "marked" },
            meta.external_labels
        );
    }
    println!();
    println!("{} block(s)", blocks.len());
    Ok(())
}

async fn cmd_blocks_mark_delete(config: &ApplicationConfig, id: &str) -> CliResult {
    let block_id: Ulid = id.parse().map_err(|e| format!("invalid block id '{}': {}", id, e))?;
    let bucket = open_bucket(config)?;
    let metastore = MetaStore::new();
    metastore.sync_from_bucket(bucket.as_ref()).await?;

    let meta = metastore
        .get(&block_id)
        .ok_or_else(|| format!("block {} not found", block_id))?;
    if !meta.is_active() {
        println!("Block {} is already marked for deletion", block_id);
        return Ok(());
    }

    let now = now_ms();
    block::write_deletion_mark(bucket.as_ref(), &meta, now).await?;
    metastore.mark_for_deletion(&block_id, now)?;
    println!("Block {} marked for deletion at {}", block_id, format_ms(now));
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> CliResult {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config);

    match &cli.command {
        Commands::CheckConfig => cmd_check_config(&config),
        Commands::Compact { once } => cmd_compact(&config, *once).await,
        Commands::Blocks { command } => match command {
            BlockCommands::List { format } => cmd_blocks_list(&config, format).await,
            BlockCommands::MarkDelete { id } => cmd_blocks_mark_delete(&config, id).await,
        },
    }
}
