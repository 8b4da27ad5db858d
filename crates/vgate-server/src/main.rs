//! vgate-server: token-gated WebSocket to TCP relay.
//!
//! Issues short-lived tokens over an HTTP API and relays authorized
//! WebSocket sessions byte-for-byte to backend console ports (VNC and the
//! like), closing each session once its token is revoked or expires.

mod api;
mod auth;
mod config;
mod relay;
mod server;
mod store;
mod transport;

use clap::Parser;
use config::{ServerConfig, StoreBackend};
use server::GateServer;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// vgate-server: console gateway
#[derive(Parser, Debug)]
#[command(name = "vgate-server", version, about = "Token-gated WebSocket to TCP console relay")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.vgate/config.toml")]
    config: String,

    /// WebSocket relay port
    #[arg(long)]
    ws_port: Option<u16>,

    /// HTTP API port
    #[arg(long)]
    api_port: Option<u16>,

    /// Token store backend
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    /// Token time-to-live in seconds
    #[arg(long)]
    token_ttl: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting vgate-server");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.ws_port,
        cli.api_port,
        cli.store,
        cli.token_ttl,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let token_store = match store::open(&server_config.store).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open token store");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let running = match GateServer::new(server_config, token_store)
        .start(shutdown.clone())
        .await
    {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    info!("received shutdown signal");
    shutdown.cancel();
    running.wait().await;

    info!("vgate-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
