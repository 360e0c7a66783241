//! Gateway entry point: starts the device TCP server and the admin HTTP API,
//! then runs until SIGINT/SIGTERM.

use clap::Parser;
use dgw_server::api::{self, ApiState};
use dgw_server::config::GatewayConfig;
use dgw_server::server::{GatewayServer, ServerConfig};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// dgw-server — device control gateway
#[derive(Parser, Debug)]
#[command(name = "dgw-server", version, about = "Device control gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "configs/gateway.toml")]
    config: String,

    /// TCP listen address for device connections
    #[arg(long)]
    tcp_addr: Option<String>,

    /// HTTP listen address for the admin API
    #[arg(long)]
    http_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting dgw-server");

    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(
        Some(&config_path),
        cli.tcp_addr.as_deref(),
        cli.http_addr.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if config.keys.is_empty() {
        warn!("no auth keys configured — device authentication will fail");
    }

    let server = GatewayServer::new(ServerConfig {
        addr: config.tcp_addr.clone(),
        heartbeat_interval: config.heartbeat_interval,
        session_timeout: config.session_timeout,
        keys: config.keys.clone(),
        time_window_secs: config.time_window_secs,
    });

    if let Err(e) = server.start().await {
        error!(error = %e, addr = %config.tcp_addr, "failed to start TCP server");
        std::process::exit(1);
    }

    let state = ApiState {
        sessions: server.session_manager(),
        ack_waiter: server.ack_waiter(),
    };
    let app = api::router(state);

    let http_listener = match tokio::net::TcpListener::bind(&config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %config.http_addr, "failed to bind HTTP listener");
            server.stop().await;
            std::process::exit(1);
        }
    };
    info!(addr = %config.http_addr, "HTTP server listening");

    if let Err(e) = axum::serve(http_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "HTTP server error");
    }

    info!("shutting down");
    server.stop().await;
    info!("dgw-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
