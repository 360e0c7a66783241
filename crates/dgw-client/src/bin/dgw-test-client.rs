//! Test device: connects to a gateway and answers `OPEN_WEB` commands.

use clap::Parser;
use dgw_client::{ClientConfig, CommandOutcome, DeviceClient};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// dgw-test-client — simulated device for gateway testing
#[derive(Parser, Debug)]
#[command(name = "dgw-test-client", version, about = "Simulated gateway device")]
struct Cli {
    /// Gateway TCP address
    #[arg(long, default_value = "127.0.0.1:9001")]
    server_addr: String,

    /// Tenant identifier
    #[arg(long, default_value = "A1")]
    appid: String,

    /// Device serial number
    #[arg(long, default_value = "SN123456")]
    sn: String,

    /// Shared secret for the appid
    #[arg(long, default_value = "K_SECRET_ABC")]
    key: String,

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

    let config = ClientConfig {
        server_addr: cli.server_addr,
        appid: cli.appid,
        sn: cli.sn.clone(),
        key: cli.key,
        meta: [
            ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ("os".to_string(), std::env::consts::OS.to_string()),
        ]
        .into_iter()
        .collect(),
        ..ClientConfig::default()
    };

    let client = DeviceClient::new(
        config,
        Arc::new(|cmd| match cmd.cmd.as_str() {
            "OPEN_WEB" => match cmd.args.get("url").and_then(|v| v.as_str()) {
                Some(url) => {
                    info!(url = %url, "would open url");
                    // Simulate the work a real device would do.
                    std::thread::sleep(Duration::from_millis(500));
                    CommandOutcome::ok(format!("url opened: {url}"))
                }
                None => CommandOutcome::error("invalid url parameter"),
            },
            other => {
                warn!(cmd = %other, "unknown command");
                CommandOutcome::error("unknown command")
            }
        }),
    );

    let sn = cli.sn;
    client.set_connected_callback(Arc::new(move |connected| {
        if connected {
            info!(sn = %sn, "device connected");
        } else {
            warn!(sn = %sn, "device disconnected");
        }
    }));

    info!("starting test client");
    client.start();

    tokio::signal::ctrl_c().await.ok();
    info!("stopping test client");
    client.stop().await;
}
