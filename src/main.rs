//! # MediaRelay
//!
//! Relays inbound media items to a webhook: related items are grouped into
//! one bundle, bundles are held back on a humanized schedule, and outbound
//! traffic goes through a rotating egress proxy.
//!
//! Usage:
//!   mediarelay run < items.jsonl          # Relay JSON-lines items from stdin
//!   mediarelay queue status               # Inspect the persisted queue
//!   mediarelay queue clear                # Drop queued items and their files
//!   mediarelay proxy test                 # Probe every configured proxy
//!   mediarelay staging cleanup            # Sweep stale staged files
//!   mediarelay config show                # Print the effective config

mod download;
mod forward;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mediarelay_core::config::{QueueConfig, StorageBackend, expand_path};
use mediarelay_core::{Artifact, BundleSink, Forwarder, InboundItem, RelayConfig, SnapshotStorage, SystemClock};
use mediarelay_grouping::GroupAggregator;
use mediarelay_proxy::ProxyPool;
use mediarelay_queue::{DispatchQueue, FileStorage, SqliteStorage};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use crate::download::LocalDownloader;
use crate::forward::{DirectSink, WebhookForwarder};

#[derive(Parser)]
#[command(
    name = "mediarelay",
    version,
    about = "📦 MediaRelay: grouped, delayed, proxied media forwarding"
)]
struct Cli {
    /// Config file (default: ~/.mediarelay/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Relay JSON-lines items read from stdin until Ctrl-C
    Run,
    /// Inspect or empty the dispatch queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Inspect the egress proxy pool
    Proxy {
        #[command(subcommand)]
        action: ProxyAction,
    },
    /// Inspect or sweep the download staging directory
    Staging {
        #[command(subcommand)]
        action: StagingAction,
    },
    /// Configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show counters and pending items
    Status,
    /// Remove every pending item and delete its staged files
    Clear,
}

#[derive(Subcommand)]
enum ProxyAction {
    /// Probe every candidate
    Test,
    /// Rotate to the next reachable candidate
    Rotate,
    /// Show pool statistics
    Stats,
}

#[derive(Subcommand)]
enum StagingAction {
    /// Show file count and total size
    Status,
    /// Delete staged files no queued item refers to
    Cleanup {
        /// Minimum age in hours (default: download.cleanup_max_age_hours)
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "mediarelay=debug,mediarelay_core=debug,mediarelay_grouping=debug,mediarelay_queue=debug,mediarelay_proxy=debug"
    } else {
        "mediarelay=info,mediarelay_core=info,mediarelay_grouping=info,mediarelay_queue=info,mediarelay_proxy=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => RelayConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RelayConfig::load()?,
    };

    match cli.command {
        Command::Run => run(config).await,
        Command::Queue { action } => queue_command(&config.queue, action).await,
        Command::Proxy { action } => proxy_command(&config, action).await,
        Command::Staging { action } => staging_command(&config, action).await,
        Command::Config { action: ConfigAction::Show } => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn open_queue(config: &QueueConfig) -> Result<DispatchQueue> {
    let path = expand_path(&config.save_path);
    let storage: Box<dyn SnapshotStorage> = match config.storage {
        StorageBackend::Json => Box::new(FileStorage::new(&path)),
        StorageBackend::Sqlite => Box::new(SqliteStorage::open(&path.with_extension("db"))?),
    };
    Ok(DispatchQueue::new(config.clone(), Some(storage), Arc::new(SystemClock)))
}

/// Staged files still owned by queued entries.
async fn queued_paths(queue: &DispatchQueue) -> HashSet<PathBuf> {
    queue
        .pending_items()
        .await
        .into_iter()
        .flat_map(|item| item.files.into_iter().map(|f| f.path))
        .collect()
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}

async fn run(config: RelayConfig) -> Result<()> {
    anyhow::ensure!(
        !config.forward.webhook_url.is_empty(),
        "forward.webhook_url is not set"
    );

    let pool = Arc::new(ProxyPool::from_config(&config.proxy)?);
    tracing::info!("🌐 Egress: {}", pool.current_info().await);

    let forwarder: Arc<dyn Forwarder> = Arc::new(WebhookForwarder::new(&config.forward, pool));
    let downloader = Arc::new(LocalDownloader::from_config(&config.download)?);

    let queue = if config.queue.enabled {
        Some(Arc::new(open_queue(&config.queue)?))
    } else {
        tracing::info!("⚡ Queue disabled, forwarding immediately");
        None
    };
    if config.download.cleanup_max_age_hours > 0 {
        let keep = match &queue {
            Some(queue) => queued_paths(queue).await,
            None => HashSet::new(),
        };
        let max_age = hours(config.download.cleanup_max_age_hours);
        if let Err(e) = downloader.cleanup_old_files(max_age, &keep).await {
            tracing::warn!("⚠️ Staging cleanup failed: {e}");
        }
    }
    if let Some(queue) = &queue {
        queue.start_processing(forwarder.clone()).await;
    }
    let sink: Arc<dyn BundleSink> = match &queue {
        Some(queue) => queue.clone(),
        None => Arc::new(DirectSink::new(forwarder.clone())),
    };
    let aggregator = Arc::new(GroupAggregator::new(config.grouping.clone(), downloader, sink));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupted = false;
    tracing::info!("🚀 MediaRelay running, reading items from stdin");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    tracing::info!("📭 Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<InboundItem>(&line) {
                    Ok(item) => aggregator.on_item(item).await,
                    Err(e) => tracing::warn!("⚠️ Skipping malformed item: {e}"),
                }
            }
            _ = &mut shutdown => {
                interrupted = true;
                break;
            }
        }
    }

    aggregator.shutdown().await;

    if let Some(queue) = queue {
        if !interrupted {
            let status = queue.get_status().await;
            tracing::info!(
                "⏳ {} items still queued, Ctrl-C to stop",
                status.pending_count
            );
            shutdown.await?;
        }
        queue.stop_processing().await;
        let status = queue.get_status().await;
        tracing::info!(
            "📊 Sent {}, failed {}, {} left in queue",
            status.total_sent,
            status.total_failed,
            status.pending_count
        );
    }
    tracing::info!("🛑 MediaRelay stopped");
    Ok(())
}

async fn queue_command(config: &QueueConfig, action: QueueAction) -> Result<()> {
    let queue = open_queue(config)?;
    match action {
        QueueAction::Status => {
            let status = queue.get_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            for item in queue.pending_items().await {
                println!(
                    "  {} | item {} | {} files | send at {} | retries {}/{}",
                    item.id,
                    item.message_id,
                    item.files.len(),
                    item.send_time.format("%Y-%m-%d %H:%M:%S UTC"),
                    item.retry_count,
                    item.max_retries
                );
            }
        }
        QueueAction::Clear => {
            let removed = queue.take_all().await;
            for item in &removed {
                Artifact::release_all(&item.files).await;
            }
            println!("🧹 Removed {} queued items", removed.len());
        }
    }
    Ok(())
}

async fn staging_command(config: &RelayConfig, action: StagingAction) -> Result<()> {
    let downloader = LocalDownloader::from_config(&config.download)?;
    match action {
        StagingAction::Status => {
            let stats = downloader.stats().await?;
            println!("📁 {}", downloader.staging_dir().display());
            println!(
                "{} files, {:.1} MB",
                stats.total_files,
                stats.total_bytes as f64 / (1024.0 * 1024.0)
            );
        }
        StagingAction::Cleanup { max_age_hours } => {
            let queue = open_queue(&config.queue)?;
            let keep = queued_paths(&queue).await;
            let max_age = hours(max_age_hours.unwrap_or(config.download.cleanup_max_age_hours));
            let removed = downloader.cleanup_old_files(max_age, &keep).await?;
            println!("🧹 Removed {removed} staged files ({} kept for queued items)", keep.len());
        }
    }
    Ok(())
}

async fn proxy_command(config: &RelayConfig, action: ProxyAction) -> Result<()> {
    let pool = ProxyPool::from_config(&config.proxy)?;
    match action {
        ProxyAction::Test => {
            let results = pool.test_all().await;
            if results.is_empty() {
                println!("🚫 No proxy configured");
            }
            for (name, ok) in &results {
                println!("{} {name}", if *ok { "✅" } else { "❌" });
            }
        }
        ProxyAction::Rotate => {
            let name = pool.force_rotate().await?;
            println!("🔄 Rotated to {name}");
        }
        ProxyAction::Stats => {
            println!("{}", pool.current_info().await);
            println!("{}", serde_json::to_string_pretty(&pool.get_statistics().await)?);
        }
    }
    Ok(())
}
