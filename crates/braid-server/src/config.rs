//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`braid.toml`)
//! - Environment variables (`BRAID_*`, nested keys separated by `__`,
//!   e.g. `BRAID_PEER__HANDSHAKE_TIMEOUT_MS`)

use anyhow::{Context, Result};
use braid_protocol::PeerId;
use braid_transport::SocketLimits;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::server::ServerConfig;

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

    /// Peer mesh configuration.
    #[serde(default)]
    pub peer: PeerConfig,

    /// Replicated data configuration.
    #[serde(default)]
    pub data: DataConfig,

    /// Shutdown configuration.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

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

    /// Frames above this size are split into multipart containers.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,

    /// Queued bytes above which bulk senders wait for the socket to drain.
    #[serde(default = "default_max_backpressure")]
    pub max_backpressure: usize,
}

/// A peer dialed at start-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Websocket URL of the peer.
    pub address: String,

    /// Credentials presented to the peer.
    #[serde(default)]
    pub credentials: Value,
}

/// Peer mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Fixed peer id. Random if unset.
    #[serde(default)]
    pub id: Option<u64>,

    /// Credentials and peer handshake timeout in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Full sync timeout in milliseconds.
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_ms: u64,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Link timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Peers dialed at start-up.
    #[serde(default)]
    pub connect: Vec<PeerAddress>,
}

/// Replicated data configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Tombstone flush interval in milliseconds.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Tombstone retention in milliseconds.
    #[serde(default = "default_tombstone_max_age")]
    pub tombstone_max_age_ms: u64,

    /// Grace period before keys without subscribers are deleted, in
    /// milliseconds.
    #[serde(default = "default_key_expiry")]
    pub key_expiry_ms: u64,

    /// Skip `set` calls that would not change a value.
    #[serde(default)]
    pub deduplicate: bool,

    /// Insertions per data chunk streamed to a newly linked peer.
    #[serde(default = "default_sync_chunk_size")]
    pub sync_chunk_size: usize,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Time allowed for sockets to close in milliseconds.
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
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

fn default_max_payload() -> usize {
    braid_transport::socket::DEFAULT_MAX_PAYLOAD
}

fn default_max_backpressure() -> usize {
    braid_transport::socket::DEFAULT_MAX_BACKPRESSURE
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_sync_timeout() -> u64 {
    60_000
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_flush_interval() -> u64 {
    10_000
}

fn default_tombstone_max_age() -> u64 {
    300_000
}

fn default_key_expiry() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_sync_chunk_size() -> usize {
    100
}

fn default_close_timeout() -> u64 {
    10_000
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
            peer: PeerConfig::default(),
            data: DataConfig::default(),
            shutdown: ShutdownConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_payload: default_max_payload(),
            max_backpressure: default_max_backpressure(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            id: None,
            handshake_timeout_ms: default_handshake_timeout(),
            sync_timeout_ms: default_sync_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            connect: Vec::new(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval(),
            tombstone_max_age_ms: default_tombstone_max_age(),
            key_expiry_ms: default_key_expiry(),
            deduplicate: false,
            sync_chunk_size: default_sync_chunk_size(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            close_timeout_ms: default_close_timeout(),
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
    /// Load configuration from the first file found, layered with
    /// `BRAID_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "braid.toml",
            "/etc/braid/braid.toml",
            "~/.config/braid/braid.toml",
        ];

        let mut builder = config::Config::builder();
        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                builder = builder.add_source(
                    config::File::from(Path::new(expanded.as_ref()))
                        .format(config::FileFormat::Toml),
                );
                break;
            }
        }

        builder
            .add_source(
                config::Environment::with_prefix("BRAID")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Load configuration from a specific file.
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

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Engine configuration derived from this file configuration.
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            peer_id: self.peer.id.map(PeerId),
            limits: SocketLimits {
                max_payload: self.transport.max_payload,
                max_backpressure: self.transport.max_backpressure,
            },
            handshake_timeout: Duration::from_millis(self.peer.handshake_timeout_ms),
            sync_timeout: Duration::from_millis(self.peer.sync_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.peer.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.peer.heartbeat_timeout_ms),
            flush_interval: Duration::from_millis(self.data.flush_interval_ms),
            tombstone_max_age: Duration::from_millis(self.data.tombstone_max_age_ms),
            key_expiry: Duration::from_millis(self.data.key_expiry_ms),
            deduplicate: self.data.deduplicate,
            sync_chunk_size: self.data.sync_chunk_size,
            close_timeout: Duration::from_millis(self.shutdown.close_timeout_ms),
            ..ServerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.transport.max_payload, 100 * 1024 * 1024);
        assert!(config.peer.connect.is_empty());
        assert!(!config.data.deduplicate);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let invalid = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(invalid.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [peer]
            id = 42
            handshake_timeout_ms = 2000

            [[peer.connect]]
            address = "ws://10.0.0.2:9000/ws"
            credentials = { token = "secret" }

            [data]
            deduplicate = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.peer.connect.len(), 1);
        assert_eq!(
            config.peer.connect[0].credentials,
            serde_json::json!({"token": "secret"})
        );

        let server = config.server_config();
        assert_eq!(server.peer_id, Some(PeerId(42)));
        assert_eq!(server.handshake_timeout, Duration::from_secs(2));
        assert!(server.deduplicate);
        assert_eq!(server.sync_chunk_size, 100);
    }
}
