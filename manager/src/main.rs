//! Orchestration Manager
//!
//! The manager accepts declarative task events, schedules each task onto one
//! of the configured workers, and continuously reconciles observed state with
//! desired state. Three periodic loops drive it: the process loop dispatches
//! pending events, the update loop pulls node stats and task state from the
//! workers, and the health loop probes running tasks and restarts failures
//! within the restart budget.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod api;
mod config;
mod manager;
mod node;
mod scheduler;

use config::ManagerConfig;
use manager::Manager;
use shared::task::{Event, Task};
use shared::{MemoryStore, SqliteStore, Store};

/// How often the process loop dispatches one pending event.
const PROCESS_INTERVAL: Duration = Duration::from_secs(10);
/// How often node stats and worker task state are pulled.
const UPDATE_INTERVAL: Duration = Duration::from_secs(15);
/// How often running tasks are health checked.
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// Command-line arguments for the manager
#[derive(Parser, Debug)]
#[command(name = "manager")]
#[command(about = "Orchestration manager that schedules container tasks onto workers", long_about = None)]
struct CliArgs {
    /// Path to an optional manager configuration file (manager.toml)
    #[arg(long = "config", value_name = "CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Override the listen address from the config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Comma-separated worker addresses (host:port), overriding the config file
    #[arg(long = "workers", value_name = "ADDRESSES", value_delimiter = ',')]
    workers: Option<Vec<String>>,

    /// Override the scheduler from the config file (roundrobin|epvm)
    #[arg(long = "scheduler", value_name = "NAME")]
    scheduler: Option<String>,

    /// Override the store backend from the config file (memory|sqlite)
    #[arg(long = "store", value_name = "BACKEND")]
    store_backend: Option<String>,

    /// Override the data directory from the config file
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<String>,
}

fn build_stores(
    config: &ManagerConfig,
) -> Result<(Box<dyn Store<Task>>, Box<dyn Store<Event>>)> {
    match config.store_backend.as_str() {
        "sqlite" => {
            let data_dir = PathBuf::from(&config.data_dir);
            let task_path = data_dir.join("tasks.db");
            let event_path = data_dir.join("events.db");
            let tasks: SqliteStore<Task> = SqliteStore::open(&task_path, "tasks")
                .with_context(|| format!("Failed to open task store {}", task_path.display()))?;
            let events: SqliteStore<Event> = SqliteStore::open(&event_path, "events")
                .with_context(|| {
                    format!("Failed to open event store {}", event_path.display())
                })?;
            info!(dir = %data_dir.display(), "Using durable task and event stores");
            Ok((Box::new(tasks), Box::new(events)))
        }
        _ => {
            info!("Using in-memory task and event stores");
            Ok((Box::new(MemoryStore::new()), Box::new(MemoryStore::new())))
        }
    }
}

/// Spawn the three periodic manager loops, each listening for shutdown.
fn spawn_loops(
    manager: Arc<Manager>,
    shutdown_tx: &tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    let process_manager = Arc::clone(&manager);
    let mut process_shutdown_rx = shutdown_tx.subscribe();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(PROCESS_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    process_manager.send_work().await;
                }
                _ = process_shutdown_rx.recv() => {
                    info!("Process loop received shutdown signal");
                    break;
                }
            }
        }
    }));

    let update_manager = Arc::clone(&manager);
    let mut update_shutdown_rx = shutdown_tx.subscribe();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPDATE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    update_manager.update_nodes().await;
                    update_manager.update_tasks().await;
                }
                _ = update_shutdown_rx.recv() => {
                    info!("Update loop received shutdown signal");
                    break;
                }
            }
        }
    }));

    let health_manager = Arc::clone(&manager);
    let mut health_shutdown_rx = shutdown_tx.subscribe();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    info!("Performing task health checks");
                    health_manager.do_health_checks().await;
                }
                _ = health_shutdown_rx.recv() => {
                    info!("Health loop received shutdown signal");
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
    let file_appender = tracing_appender::rolling::daily("./logs", "manager.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("manager=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    let mut config = match ManagerConfig::load(cli_args.config_file.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load manager configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Apply command-line overrides if provided.
    if let Some(listen_address) = cli_args.listen_address {
        config.listen_address = listen_address;
    }
    if let Some(workers) = cli_args.workers {
        config.workers = workers;
    }
    if let Some(scheduler) = cli_args.scheduler {
        config.scheduler = scheduler;
    }
    if let Some(store_backend) = cli_args.store_backend {
        config.store_backend = store_backend;
    }
    if let Some(data_dir) = cli_args.data_dir {
        config.data_dir = data_dir;
    }

    if let Err(e) = config.validate() {
        error!("Invalid manager configuration: {}", e);
        std::process::exit(1);
    }

    info!(
        listen_address = %config.listen_address,
        worker_count = config.workers.len(),
        scheduler = %config.scheduler,
        store = %config.store_backend,
        "Starting orchestration manager"
    );

    // A store that cannot be opened is fatal initialization.
    let (task_store, event_store) = match build_stores(&config) {
        Ok(stores) => stores,
        Err(e) => {
            error!("Failed to initialize stores: {}", e);
            std::process::exit(1);
        }
    };

    let scheduler = match scheduler::from_name(&config.scheduler) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!("Failed to initialize scheduler: {}", e);
            std::process::exit(1);
        }
    };

    let manager = match Manager::new(config.workers.clone(), scheduler, task_store, event_store) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!("Failed to initialize manager: {}", e);
            std::process::exit(1);
        }
    };

    // Prime the node views so the first dispatch can schedule sensibly.
    manager.update_nodes().await;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let loop_handles = spawn_loops(Arc::clone(&manager), &shutdown_tx);

    let app = api::create_router(api::AppState {
        manager: Arc::clone(&manager),
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
    info!("Manager shutdown complete");
    Ok(())
}
