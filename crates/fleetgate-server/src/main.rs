//! Main entry point for the fleetgate ingestion daemon

use clap::Parser;
use fleetgate_core::{Result, config::Config, init_logging};
use fleetgate_database::{Database, Gateway, RetryGateway};
use fleetgate_engine::engine::EngineCore;
use fleetgate_engine::{
    AvlEngine, Bootloader, MeiligaoEngine, NoopNotifier, Notifier, Registry, SessionStore,
    WebhookNotifier,
};
use fleetgate_server::listeners::{self, TcpOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Telemetry ingestion daemon for GPS tracker fleets
#[derive(Parser, Debug)]
#[command(name = "fleetgate", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Firmware image offered to devices flagged for update
    /// (overrides the configured path)
    #[arg(long)]
    firmware: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) if cli.config.is_some() => {
            error!("Failed to load configuration: {e}");
            return Err(e);
        }
        Err(e) => {
            info!("Failed to load config ({e}), using defaults");
            Config::default()
        }
    };
    if let Some(path) = cli.firmware {
        config.firmware.path = Some(path);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting fleetgate");

    let database = match Database::new(&config).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!("Failed to connect to database: {e}");
            return Err(e);
        }
    };
    if let Err(e) = database.migrate().await {
        error!("Database migration failed: {e}");
        return Err(e);
    }
    database.health_check().await?;

    let gateway: Arc<dyn Gateway> = Arc::new(RetryGateway::new(database.gateway()));
    let registry = Arc::new(Registry::new(gateway.clone(), config.provisioning.clone()));
    let sessions = Arc::new(SessionStore::new(gateway.clone(), config.sessions.clone()));
    let notifier: Arc<dyn Notifier> = match WebhookNotifier::from_config(&config.notifier)? {
        Some(webhook) => Arc::new(webhook),
        None => Arc::new(NoopNotifier),
    };
    let core = EngineCore::new(registry, sessions.clone(), gateway, notifier);

    let bootloader = match &config.firmware.path {
        Some(path) => {
            let loader = Bootloader::load(path).inspect_err(|e| {
                error!(path = %path.display(), "Failed to load firmware image: {e}");
            })?;
            info!(path = %path.display(), "Firmware image loaded");
            Some(Arc::new(loader))
        }
        None => None,
    };

    let avl = Arc::new(AvlEngine::new(core.clone(), bootloader));
    let meiligao = Arc::new(MeiligaoEngine::new(core.clone()));

    let host = config.listeners.host.clone();
    let options = TcpOptions::from_config(&config.listeners);
    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    let mut avl_ports = vec![config.listeners.avl_port];
    avl_ports.extend(config.listeners.avl_legacy_port);
    for port in avl_ports {
        let socket = UdpSocket::bind((host.as_str(), port)).await?;
        info!(port, "AVL UDP listener bound");
        tasks.push(tokio::spawn(listeners::run_avl_udp(
            socket,
            avl.clone(),
            shutdown.clone(),
        )));
    }

    let socket = UdpSocket::bind((host.as_str(), config.listeners.meiligao_port)).await?;
    info!(port = config.listeners.meiligao_port, "Meiligao UDP listener bound");
    tasks.push(tokio::spawn(listeners::run_meiligao_udp(
        socket,
        meiligao,
        shutdown.clone(),
    )));

    let listener = TcpListener::bind((host.as_str(), config.listeners.concox_port)).await?;
    info!(port = config.listeners.concox_port, "Concox TCP listener bound");
    tasks.push(tokio::spawn(listeners::run_concox_tcp(
        listener,
        core.clone(),
        options,
        shutdown.clone(),
    )));

    let listener = TcpListener::bind((host.as_str(), config.listeners.wialon_port)).await?;
    info!(port = config.listeners.wialon_port, "Wialon TCP listener bound");
    tasks.push(tokio::spawn(listeners::run_wialon_tcp(
        listener,
        core.clone(),
        options,
        shutdown.clone(),
    )));

    let listener = TcpListener::bind((host.as_str(), config.listeners.satellite_port)).await?;
    info!(port = config.listeners.satellite_port, "Satellite TCP listener bound");
    tasks.push(tokio::spawn(listeners::run_satellite_tcp(
        listener,
        core,
        options,
        shutdown.clone(),
    )));

    tasks.push(tokio::spawn(listeners::run_session_sweeper(
        sessions,
        Duration::from_secs(config.sessions.sweep_interval_secs),
        shutdown.clone(),
    )));

    info!("All listeners up");
    shutdown_signal().await;
    shutdown.cancel();

    let drain = Duration::from_secs(config.listeners.drain_secs);
    for task in tasks {
        if tokio::time::timeout(drain, task).await.is_err() {
            warn!("A listener did not stop within the drain window");
        }
    }
    info!("Shutdown complete");
    Ok(())
}

/// Handle graceful shutdown signals
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received terminate signal, shutting down gracefully...");
        },
    }
}
