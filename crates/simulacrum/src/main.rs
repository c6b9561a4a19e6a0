//! Simulacrum Server
//!
//! Runs one simulator process and serves its PVs over WebSocket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use simulacrum::config::SimulacrumConfig;
use simulacrum::launch::{Process, launch};
use simulacrum::server::{AppState, create_router};
use simulacrum_runtime::ServiceManager;

/// Simulacrum accelerator simulator
#[derive(Parser, Debug)]
#[command(name = "simulacrum")]
#[command(about = "Simulated accelerator control system", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server host address; overrides the configured one
    #[arg(long)]
    host: Option<String>,

    /// Server port; overrides the configured one
    #[arg(long)]
    port: Option<u16>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    process: Process,
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("simulacrum=info,simulacrum_runtime=info,tower_http=debug"));
    tracing_subscriber::registry()
        .with(filter)
        .with(args.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.log_json).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting Simulacrum {} v{}", args.process.name(), env!("CARGO_PKG_VERSION"));

    let mut config = SimulacrumConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let service_manager = Arc::new(ServiceManager::new());
    let pv = match launch(&service_manager, &args.process, &config).await {
        Ok(pv) => pv,
        Err(e) => {
            if let Err(stop) = service_manager.shutdown_all().await {
                warn!("Some services did not shut down cleanly: {}", stop);
            }
            return Err(e);
        }
    };

    let state = AppState::new(args.process.name(), pv);
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid server address {}:{}", config.server.host, config.server.port))?;
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{}/ws", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service_manager.clone()))
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then stop every service
async fn shutdown_signal(service_manager: Arc<ServiceManager>) {
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }

    info!("Shutting down services...");
    if let Err(e) = service_manager.shutdown_all().await {
        warn!("Some services did not shut down cleanly: {}", e);
    }
}
