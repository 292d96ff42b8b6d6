//! Router Scheduler - multi-provider LLM request router
//!
//! # Usage
//!
//! ```bash
//! # Run with ./router.toml (or built-in defaults)
//! cargo run --release
//!
//! # Explicit config and listen address
//! ./router-scheduler --config /etc/router/router.toml --addr 127.0.0.1:9000
//! ```
//!
//! # Environment Variables
//!
//! - `ROUTER_CONFIG`: Path to the TOML config (default: ./router.toml)
//! - `ROUTER_SERVER_ADDR`: Overrides `server.addr`
//! - `RUST_LOG`: Logging level (default: info)
//! - `RESET_DB`: Set to "true" to wipe all persistent data on startup (for testing)

use anyhow::{Context, Result};
use axum::Router;
use chrono::Utc;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use router_scheduler::api::{self, ApiState};
use router_scheduler::capacity::{run_snapshot_retention, HttpProbe, MonitorSupervisor, SnapshotBoard};
use router_scheduler::catalog::CatalogStore;
use router_scheduler::dispatch::{run_dispatch_triggers, Scheduler};
use router_scheduler::executor::HttpExecutor;
use router_scheduler::ledger::EventLedger;
use router_scheduler::stats::StatsProjector;
use router_scheduler::storage::Storage;
use router_scheduler::{AdmissionController, RouterConfig};

#[derive(Parser, Debug)]
#[command(name = "router-scheduler")]
#[command(about = "Multi-provider LLM request scheduler")]
#[command(version)]
struct CliArgs {
    /// Path to a TOML config file (skips the ROUTER_CONFIG / ./router.toml search)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides server.addr
    #[arg(long, value_name = "HOST:PORT")]
    addr: Option<String>,

    /// Data directory, overrides storage.data_dir
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Wipe all persistent data before starting
    #[arg(long)]
    reset_db: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "ROUTER_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Check if database reset is requested via CLI flag or environment variable.
fn should_reset_db(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    if let Ok(val) = std::env::var("RESET_DB") {
        let val_lower = val.to_lowercase();
        return val_lower == "true" || val_lower == "1" || val_lower == "yes";
    }
    false
}

fn reset_data_directory(data_path: &Path) -> Result<()> {
    if !data_path.exists() {
        info!("Data directory does not exist, nothing to reset");
        return Ok(());
    }
    warn!(path = %data_path.display(), "RESET_DB set, wiping catalog, ledger and snapshot history");
    std::fs::remove_dir_all(data_path)
        .with_context(|| format!("Failed to remove data directory {}", data_path.display()))?;
    Ok(())
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    LedgerRetry,
    CapacityMonitor,
    SnapshotRetention,
    DispatchTriggers,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::LedgerRetry => write!(f, "LedgerRetry"),
            TaskName::CapacityMonitor => write!(f, "CapacityMonitor"),
            TaskName::SnapshotRetention => write!(f, "SnapshotRetention"),
            TaskName::DispatchTriggers => write!(f, "DispatchTriggers"),
        }
    }
}

/// Spawn the HTTP server task into the JoinSet.
fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("Supervisor: task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("Supervisor: task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("Supervisor: task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("Supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // Let background loops observe cancellation and drain.
    while let Some(result) = task_set.join_next().await {
        if let Ok(Ok(task_name)) = result {
            info!("Supervisor: task {} stopped", task_name);
        }
    }
    Ok(())
}

fn load_config(args: &CliArgs) -> Result<RouterConfig> {
    let mut config = match &args.config {
        Some(path) => RouterConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RouterConfig::load(),
    };
    if let Some(addr) = &args.addr {
        config.server.addr = addr.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(config: RouterConfig, cancel_token: CancellationToken) -> Result<()> {
    let config = Arc::new(config);

    let storage = Storage::open(&config.storage.data_dir)
        .with_context(|| format!("Failed to open storage at {}", config.storage.data_dir.display()))?;

    // Catalog: persisted state first, then config-declared entries on top.
    let catalog = Arc::new(CatalogStore::load(storage.catalog()?).context("Failed to load catalog")?);
    if !config.catalog.is_empty() {
        let seed = config.catalog.clone();
        catalog
            .seed(seed.providers, seed.models, seed.policies)
            .context("Config catalog entries rejected")?;
    }
    let snapshot = catalog.snapshot();
    info!(
        version = snapshot.version(),
        providers = snapshot.providers().count(),
        models = snapshot.models().count(),
        policies = snapshot.policies().count(),
        "Catalog loaded"
    );

    let (ledger, retry_worker) = EventLedger::new(Arc::new(storage.ledger()?), config.ledger.retry_policy());
    let snapshot_store = Arc::new(storage.snapshots()?);
    let board = Arc::new(SnapshotBoard::new());

    let probe = HttpProbe::new(config.capacity.probe_timeout()).context("Failed to build probe client")?;
    let executor = HttpExecutor::new(config.capacity.probe_timeout()).context("Failed to build executor client")?;

    let scheduler = Scheduler::new(
        Arc::clone(&catalog),
        Arc::clone(&board),
        Arc::clone(&ledger),
        Arc::new(executor),
        AdmissionController::new(config.capacity.unknown_footprint_margin_mb),
        config.scheduler.clone(),
        cancel_token.clone(),
    );

    let state = ApiState {
        scheduler: Arc::clone(&scheduler),
        catalog: Arc::clone(&catalog),
        board: Arc::clone(&board),
        stats: Arc::new(StatsProjector::new(Arc::clone(&ledger), Some(Arc::clone(&snapshot_store)))),
        ledger: Arc::clone(&ledger),
        config: Arc::clone(&config),
        started_at: Utc::now(),
    };
    let app = api::create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.server.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.addr))?;
    info!(addr = %config.server.addr, "HTTP API listening on /api/v1");

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    spawn_http_server(&mut task_set, listener, app, cancel_token.clone());

    let cancel = cancel_token.clone();
    task_set.spawn(async move {
        retry_worker.run(cancel).await;
        Ok(TaskName::LedgerRetry)
    });

    let monitor = MonitorSupervisor::new(
        Arc::clone(&catalog),
        Arc::new(probe),
        Arc::clone(&board),
        Some(Arc::clone(&snapshot_store)),
        config.capacity.clone(),
    );
    let cancel = cancel_token.clone();
    task_set.spawn(async move {
        monitor.run(cancel).await;
        Ok(TaskName::CapacityMonitor)
    });

    let retention_days = config.storage.snapshot_retention_days;
    let prune_every = Duration::from_secs(config.storage.prune_interval_secs.max(1));
    let cancel = cancel_token.clone();
    task_set.spawn(async move {
        run_snapshot_retention(snapshot_store, retention_days, prune_every, cancel).await;
        Ok(TaskName::SnapshotRetention)
    });

    let cancel = cancel_token.clone();
    task_set.spawn(async move {
        run_dispatch_triggers(scheduler, board, cancel).await;
        Ok(TaskName::DispatchTriggers)
    });

    let outcome = run_supervisor(&mut task_set, cancel_token).await;

    if let Err(e) = storage.flush() {
        warn!(error = %e, "Final storage flush failed");
    }
    outcome
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.log_json);

    let config = load_config(&args)?;

    // Reset DB check, before any storage initialization
    if should_reset_db(args.reset_db) {
        reset_data_directory(&config.storage.data_dir)?;
    }

    info!(
        addr = %config.server.addr,
        data_dir = %config.storage.data_dir.display(),
        failover = config.scheduler.failover.enabled,
        "Router scheduler starting"
    );

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown_token.cancel();
    });

    run(config, cancel_token).await?;

    info!("Router scheduler shutdown complete");
    Ok(())
}
