//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use vgate_core::{GateError, GateResult, TargetEntry, TargetRegistry};

/// Which token store implementation backs the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map, lost on restart.
    Memory,
    /// Redis with native key expiry.
    Redis,
    /// SQLite table with an explicit expiry column.
    Sqlite,
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tokens: TokensSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub targets: Vec<TargetEntry>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ws_port: default_ws_port(),
            api_port: default_api_port(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

/// `[tokens]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TokensSection {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
    #[serde(default = "default_redis_op_timeout_ms")]
    pub redis_op_timeout_ms: u64,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

impl Default for TokensSection {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            ttl_secs: default_ttl_secs(),
            watch_interval_ms: default_watch_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            redis_url: default_redis_url(),
            redis_prefix: default_redis_prefix(),
            redis_op_timeout_ms: default_redis_op_timeout_ms(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

/// `[backend]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_ws_port() -> u16 {
    6080
}
fn default_api_port() -> u16 {
    5000
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}
fn default_ttl_secs() -> u64 {
    3600
}
fn default_watch_interval_ms() -> u64 {
    2000
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}
fn default_redis_prefix() -> String {
    "vgate:token:".to_string()
}
fn default_redis_op_timeout_ms() -> u64 {
    2000
}
fn default_sqlite_path() -> String {
    "~/.vgate/tokens.db".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}

/// Targets used when the config file declares none.
fn default_targets() -> Vec<TargetEntry> {
    vec![
        TargetEntry::new("vm1", "localhost", 5900),
        TargetEntry::new("vm2", "localhost", 5901),
    ]
}

/// Token store settings after overrides are applied.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub redis_url: String,
    pub redis_prefix: String,
    pub redis_op_timeout: Duration,
    pub sqlite_path: PathBuf,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub ws_port: u16,
    pub api_port: u16,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub watch_interval: Duration,
    pub store: StoreConfig,
    pub targets: TargetRegistry,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_ws_port: Option<u16>,
        cli_api_port: Option<u16>,
        cli_store: Option<StoreBackend>,
        cli_token_ttl: Option<u64>,
    ) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli_ws_port, cli_api_port, cli_store, cli_token_ttl)
    }

    /// Merge CLI overrides into a parsed config file.
    pub fn resolve(
        file_config: ConfigFile,
        cli_ws_port: Option<u16>,
        cli_api_port: Option<u16>,
        cli_store: Option<StoreBackend>,
        cli_token_ttl: Option<u64>,
    ) -> GateResult<Self> {
        let ConfigFile {
            server,
            tokens,
            backend,
            targets,
        } = file_config;

        let ttl_secs = cli_token_ttl.unwrap_or(tokens.ttl_secs);
        if ttl_secs == 0 {
            return Err(GateError::Config("token ttl must be at least 1 second".into()));
        }
        if tokens.watch_interval_ms == 0 {
            return Err(GateError::Config("watch_interval_ms must be positive".into()));
        }

        let targets = if targets.is_empty() {
            warn!("no [[targets]] configured, using built-in vm1/vm2 defaults");
            default_targets()
        } else {
            targets
        };

        Ok(Self {
            bind: server.bind,
            ws_port: cli_ws_port.unwrap_or(server.ws_port),
            api_port: cli_api_port.unwrap_or(server.api_port),
            handshake_timeout: Duration::from_millis(server.handshake_timeout_ms),
            connect_timeout: Duration::from_millis(backend.connect_timeout_ms),
            watch_interval: Duration::from_millis(tokens.watch_interval_ms),
            store: StoreConfig {
                backend: cli_store.unwrap_or(tokens.backend),
                ttl: Duration::from_secs(ttl_secs),
                sweep_interval: Duration::from_secs(tokens.sweep_interval_secs.max(1)),
                redis_url: tokens.redis_url,
                redis_prefix: tokens.redis_prefix,
                redis_op_timeout: Duration::from_millis(tokens.redis_op_timeout_ms),
                sqlite_path: expand_tilde_str(&tokens.sqlite_path),
            },
            targets: TargetRegistry::new(targets)?,
        })
    }
}

fn parse_config(content: &str) -> GateResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| GateError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
