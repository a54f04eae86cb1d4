//! Server configuration.
//!
//! Configuration is layered, lowest priority first:
//! - Built-in defaults
//! - TOML configuration file (`PARLOR_CONFIG`, or the first of the default paths)
//! - Environment variables (`PARLOR_*`, nested keys separated by `__`)

use anyhow::{Context, Result};
use parlor_core::HubConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment variable prefix.
const ENV_PREFIX: &str = "PARLOR";

/// Environment variable naming an explicit config file.
const CONFIG_PATH_VAR: &str = "PARLOR_CONFIG";

/// Paths searched for a config file when `PARLOR_CONFIG` is not set.
const DEFAULT_PATHS: [&str; 3] = [
    "parlor.toml",
    "/etc/parlor/parlor.toml",
    "~/.config/parlor/parlor.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Room configuration.
    #[serde(default)]
    pub rooms: RoomsConfig,

    /// Presence configuration.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Message storage.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum rooms per connection.
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_connection: usize,

    /// Maximum message body size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per connection, in frames.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Room configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    /// Room joined on connect.
    #[serde(default = "default_room")]
    pub default_room: String,

    /// Join `default_room` automatically on connect.
    #[serde(default = "default_true")]
    pub auto_join_default_room: bool,
}

/// Presence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Skip snapshots identical to the previous one.
    #[serde(default)]
    pub dedupe: bool,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u32,
}

/// Message storage backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process store; lost on restart.
    #[default]
    Memory,
    /// SQLite database at `storage.url`.
    Sqlite,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Which backend to use.
    #[serde(default)]
    pub backend: StorageBackend,

    /// Database URL for the SQLite backend.
    #[serde(default = "default_storage_url")]
    pub url: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    parlor_core::connection::DEFAULT_MAX_CONNECTIONS
}

fn default_max_rooms() -> usize {
    parlor_core::room::DEFAULT_MAX_ROOMS_PER_CONNECTION
}

fn default_max_message_size() -> usize {
    parlor_core::router::DEFAULT_MAX_MESSAGE_SIZE
}

fn default_outbound_queue() -> usize {
    parlor_core::connection::DEFAULT_OUTBOUND_QUEUE
}

fn default_room() -> String {
    "general".to_string()
}

fn default_heartbeat_interval() -> u32 {
    30_000 // 30 seconds
}

fn default_storage_url() -> String {
    "sqlite://parlor.db".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            rooms: RoomsConfig::default(),
            presence: PresenceConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            storage: StorageConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_rooms_per_connection: default_max_rooms(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            default_room: default_room(),
            auto_join_default_room: true,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            url: default_storage_url(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the config file (if any) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `PARLOR_CONFIG` names a missing file, or if a file
    /// or environment value cannot be parsed.
    pub fn load() -> Result<Self> {
        let file = match std::env::var_os(CONFIG_PATH_VAR) {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::find_default_file(),
        };
        if let Some(path) = &file {
            // Reports syntax errors against the file path before layering.
            Self::from_file(path)?;
        }
        Self::layered(file.as_deref(), Self::environment())
    }

    /// Load configuration from a specific file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn find_default_file() -> Option<PathBuf> {
        DEFAULT_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn layered(file: Option<&Path>, environment: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let layered = builder
            .add_source(environment)
            .build()
            .context("Failed to load configuration")?;

        layered
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Hub settings derived from this configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.limits.max_connections,
            outbound_queue: self.limits.outbound_queue,
            max_rooms_per_connection: self.limits.max_rooms_per_connection,
            max_message_size: self.limits.max_message_size,
            default_room: self
                .rooms
                .auto_join_default_room
                .then(|| self.rooms.default_room.clone()),
            dedupe_presence: self.presence.dedupe,
        }
    }
}
