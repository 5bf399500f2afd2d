//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.cabline/config.json`) and
//! environment. Covers the backend endpoints, request timeouts, and the
//! reconnection policy of the realtime connection.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Backend endpoints and request timeouts.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Realtime connection supervision settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Backend base URL and HTTP request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// HTTP base URL for /verify and /messages (default "http://127.0.0.1:4000").
    /// Overridden by CABLINE_BACKEND_URL env when set.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Verification request timeout in seconds (default 10).
    #[serde(default = "default_verify_timeout_secs")]
    pub verify_timeout_secs: u64,

    /// History request timeout in seconds (default 15).
    #[serde(default = "default_history_timeout_secs")]
    pub history_timeout_secs: u64,

    /// Maximum history entries requested (default 50).
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

/// Realtime connection settings: endpoint override and reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// WebSocket URL. When unset, derived from backend.baseUrl (http→ws) with
    /// path /ws.
    #[serde(default)]
    pub socket_url: Option<String>,

    /// Per-attempt connect handshake timeout in seconds (default 10).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Bounded connect attempts before giving up (default 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff between attempts in milliseconds (default 1000).
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Backoff ceiling in milliseconds (default 5000).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Delay before the single supervised reconnect after a server-initiated
    /// drop, in milliseconds (default 2000).
    #[serde(default = "default_server_drop_delay_ms")]
    pub server_drop_delay_ms: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:4000".to_string()
}

fn default_verify_timeout_secs() -> u64 {
    10
}

fn default_history_timeout_secs() -> u64 {
    15
}

fn default_history_limit() -> u32 {
    50
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    5000
}

fn default_server_drop_delay_ms() -> u64 {
    2000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            verify_timeout_secs: default_verify_timeout_secs(),
            history_timeout_secs: default_history_timeout_secs(),
            history_limit: default_history_limit(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            socket_url: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            server_drop_delay_ms: default_server_drop_delay_ms(),
        }
    }
}

impl BackendConfig {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_secs(self.history_timeout_secs)
    }
}

/// Resolve the backend base URL: env CABLINE_BACKEND_URL overrides config.
pub fn resolve_backend_url(config: &Config) -> String {
    std::env::var("CABLINE_BACKEND_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| config.backend.base_url.trim().to_string())
}

/// Resolve the realtime endpoint: connection.socketUrl when set, otherwise the
/// backend base URL with the scheme switched to ws(s) and path /ws.
pub fn resolve_socket_url(config: &Config, backend_url: &str) -> String {
    if let Some(ref url) = config.connection.socket_url {
        let trimmed = url.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let base = backend_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/ws", ws_base)
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CABLINE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".cabline").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or CABLINE_CONFIG_PATH). Missing file =>
/// default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
