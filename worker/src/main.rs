//! Orchestration Worker
//!
//! The worker owns a local container runtime and executes tasks dispatched to
//! it by the manager. Three periodic loops drive it: the run loop executes
//! queued tasks, the stats loop refreshes the host snapshot, and the
//! reconcile loop compares stored task state against the runtime.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod api;
mod config;
mod runtime;
mod stats;
mod worker;

use config::WorkerConfig;
use shared::task::Task;
use shared::{MemoryStore, SqliteStore, Store};
use worker::Worker;

/// How often the run loop drains one task off the queue.
const RUN_INTERVAL: Duration = Duration::from_secs(10);
/// How often host stats are refreshed.
const STATS_INTERVAL: Duration = Duration::from_secs(15);
/// How often stored state is reconciled against the runtime.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(15);

/// Command-line arguments for the worker
#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Orchestration worker that runs container tasks", long_about = None)]
struct CliArgs {
    /// Path to an optional worker configuration file (worker.toml)
    #[arg(long = "config", value_name = "CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Override the worker name from the config file
    #[arg(long = "name", value_name = "NAME")]
    name: Option<String>,

    /// Override the listen address from the config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the store backend from the config file (memory|sqlite)
    #[arg(long = "store", value_name = "BACKEND")]
    store_backend: Option<String>,

    /// Override the data directory from the config file
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<String>,
}

fn build_store(config: &WorkerConfig) -> Result<Box<dyn Store<Task>>> {
    match config.store_backend.as_str() {
        "sqlite" => {
            let path = PathBuf::from(&config.data_dir).join("tasks.db");
            let store: SqliteStore<Task> = SqliteStore::open(&path, "tasks")
                .with_context(|| format!("Failed to open task store {}", path.display()))?;
            info!(path = %path.display(), "Using durable task store");
            Ok(Box::new(store))
        }
        _ => {
            info!("Using in-memory task store");
            Ok(Box::new(MemoryStore::new()))
        }
    }
}

/// Spawn the three periodic worker loops, each listening for shutdown.
fn spawn_loops(
    worker: Arc<Worker>,
    shutdown_tx: &tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    let run_worker = Arc::clone(&worker);
    let mut run_shutdown_rx = shutdown_tx.subscribe();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(RUN_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = run_worker.run_next_task().await {
                        error!(error = %e, "Error running task");
                    }
                }
                _ = run_shutdown_rx.recv() => {
                    info!("Run loop received shutdown signal");
                    break;
                }
            }
        }
    }));

    let stats_worker = Arc::clone(&worker);
    let mut stats_shutdown_rx = shutdown_tx.subscribe();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    stats_worker.collect_stats().await;
                }
                _ = stats_shutdown_rx.recv() => {
                    info!("Stats loop received shutdown signal");
                    break;
                }
            }
        }
    }));

    let reconcile_worker = Arc::clone(&worker);
    let mut reconcile_shutdown_rx = shutdown_tx.subscribe();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    reconcile_worker.update_tasks().await;
                }
                _ = reconcile_shutdown_rx.recv() => {
                    info!("Reconcile loop received shutdown signal");
                    break;
                }
            }
        }
    }));

    handles
}

/// Sets up signal handlers for graceful shutdown.
/// Returns a future that completes when a shutdown signal is received.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging.
    let file_appender = tracing_appender::rolling::daily("./logs", "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("worker=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    let mut config = match WorkerConfig::load(cli_args.config_file.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load worker configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Apply command-line overrides if provided.
    if let Some(name) = cli_args.name {
        config.name = name;
    }
    if let Some(listen_address) = cli_args.listen_address {
        config.listen_address = listen_address;
    }
    if let Some(store_backend) = cli_args.store_backend {
        config.store_backend = store_backend;
    }
    if let Some(data_dir) = cli_args.data_dir {
        config.data_dir = data_dir;
    }

    if let Err(e) = config.validate() {
        error!("Invalid worker configuration: {}", e);
        std::process::exit(1);
    }

    info!(
        name = %config.name,
        listen_address = %config.listen_address,
        store = %config.store_backend,
        "Starting orchestration worker"
    );

    // A store that cannot be opened is fatal initialization.
    let store = match build_store(&config) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to initialize task store: {}", e);
            std::process::exit(1);
        }
    };

    let worker = Arc::new(Worker::new(&config.name, store));

    // Prime the stats snapshot so the first scheduler pass sees real numbers.
    worker.collect_stats().await;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let loop_handles = spawn_loops(Arc::clone(&worker), &shutdown_tx);

    let app = api::create_router(api::AppState {
        worker: Arc::clone(&worker),
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("Failed to bind TCP listener to {}", config.listen_address))?;
    info!("Starting HTTP server on {}", config.listen_address);

    // Relay process signals into the shutdown channel.
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        setup_shutdown_signal().await;
        let _ = signal_tx.send(());
    });

    let shutdown_signal = {
        let mut rx = shutdown_tx.subscribe();
        async move {
            let _ = rx.recv().await;
            info!("HTTP server received shutdown signal");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    for handle in loop_handles {
        let _ = handle.await;
    }
    info!("Worker shutdown complete");
    Ok(())
}
