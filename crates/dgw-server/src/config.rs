//! Server configuration: TOML file + CLI overrides.

use dgw_core::{GatewayError, GatewayResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub tcp: TcpSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[tcp]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpSection {
    #[serde(default = "default_tcp_addr")]
    pub addr: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_time_window_secs")]
    pub time_window_secs: i64,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            addr: default_tcp_addr(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            session_timeout_secs: default_session_timeout_secs(),
            time_window_secs: default_time_window_secs(),
        }
    }
}

/// `[http]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_http_addr")]
    pub addr: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            addr: default_http_addr(),
        }
    }
}

/// `[auth]` section of the config TOML: the appid → key map.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub keys: HashMap<String, String>,
}

fn default_tcp_addr() -> String {
    "0.0.0.0:9001".to_string()
}
fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_session_timeout_secs() -> u64 {
    90
}
fn default_time_window_secs() -> i64 {
    dgw_core::auth::DEFAULT_TIME_WINDOW_SECS
}

/// Resolved gateway configuration (CLI overrides applied, durations parsed).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub tcp_addr: String,
    pub http_addr: String,
    pub heartbeat_interval: Duration,
    pub session_timeout: Duration,
    pub time_window_secs: i64,
    /// appid → shared secret.
    pub keys: HashMap<String, String>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// A missing file falls back to defaults; a file that exists but fails
    /// to parse is a startup error, as is an invalid timeout relationship.
    pub fn load(
        config_path: Option<&Path>,
        cli_tcp_addr: Option<&str>,
        cli_http_addr: Option<&str>,
    ) -> GatewayResult<Self> {
        let file_config = match config_path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| GatewayError::Config(format!("config parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        let config = Self {
            tcp_addr: cli_tcp_addr
                .map(str::to_string)
                .unwrap_or(file_config.tcp.addr),
            http_addr: cli_http_addr
                .map(str::to_string)
                .unwrap_or(file_config.http.addr),
            heartbeat_interval: Duration::from_secs(file_config.tcp.heartbeat_interval_secs),
            session_timeout: Duration::from_secs(file_config.tcp.session_timeout_secs),
            time_window_secs: file_config.tcp.time_window_secs,
            keys: file_config.auth.keys,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> GatewayResult<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(GatewayError::Config(
                "heartbeat_interval_secs must be positive".into(),
            ));
        }
        // A single missed ping must not evict the session.
        if self.session_timeout < 2 * self.heartbeat_interval {
            return Err(GatewayError::Config(format!(
                "session_timeout_secs ({}) must be at least twice heartbeat_interval_secs ({})",
                self.session_timeout.as_secs(),
                self.heartbeat_interval.as_secs()
            )));
        }
        if self.time_window_secs <= 0 {
            return Err(GatewayError::Config(
                "time_window_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}
