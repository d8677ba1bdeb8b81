//! wsproxy
//!
//! Path-based WebSocket reverse proxy. Each inbound upgrade request is routed
//! by its path to a backend WebSocket, and frames are relayed both ways until
//! either side closes.

mod config;
mod logging;
mod proxy;
mod routing;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{debug, error, info, warn};

use config::{ConfigError, ProxyConfig, DEFAULT_CONFIG_FILE};
use logging::LogOptions;
use proxy::SessionSupervisor;
use routing::RoutingTable;
use server::{ProxyServer, ServerConfig};

/// How long to wait for live sessions to close on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// wsproxy
///
/// Path-based WebSocket reverse proxy
#[derive(Parser, Debug)]
#[command(name = "wsproxy")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Only write logs to the log file
    #[arg(long, requires = "log_file")]
    quiet_stdout: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Held until main returns so the log file is flushed on every exit path
    let _log_guard = logging::init(&LogOptions {
        verbose: args.verbose,
        file: args.log_file.clone(),
        stdout: !args.quiet_stdout,
    })?;

    info!("wsproxy v{}", env!("CARGO_PKG_VERSION"));

    info!("Loading config file: {}", args.config.display());
    let (config, routes) = match load(&args.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    info!("Loaded {} routes", routes.len());
    if routes.is_empty() {
        warn!("No services configured, every request will get 404");
    }
    for (path, url) in routes.iter() {
        debug!("ws proxy: {} -> {}", path, url);
    }
    if let Some(limit) = config.max_sessions {
        info!("Session limit: {}", limit);
    }

    let server_config = ServerConfig::new(config.bind.clone(), config.listen_port)
        .with_dial_timeout(config.dial_timeout());
    let supervisor = SessionSupervisor::new(config.max_sessions);
    let server = Arc::new(ProxyServer::new(server_config, routes, supervisor.clone()));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Notice: ws:// only, wss:// is not supported
    server.run().await?;

    supervisor.drain(SHUTDOWN_TIMEOUT).await;
    info!("Server shutdown complete");
    Ok(())
}

/// Load the config file and build the routing table from it
fn load(path: &Path) -> Result<(ProxyConfig, RoutingTable), ConfigError> {
    let config = ProxyConfig::load(path)?;
    let routes = RoutingTable::load(config.services.iter().map(|(p, u)| (p, u.clone())))?;
    Ok((config, routes))
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
