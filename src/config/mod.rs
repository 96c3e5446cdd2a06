//! Configuration management

use crate::mux::MuxConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {e}")))
    }
}

/// Which tunnel flavor the peers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// One tunnel connection per user connection
    Tcp,
    /// Stream-multiplexed tunnel connections
    Tcpmux,
}

impl Default for TransportMode {
    fn default() -> Self {
        TransportMode::Tcp
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the tunnel listener binds
    pub bind_addr: String,
    /// Shared bearer token for the control-channel handshake
    pub token: String,
    /// Tunnel flavor
    #[serde(default)]
    pub transport: TransportMode,
    /// Port mappings, `"L=R"` entries with bare-port shorthands
    pub ports: Vec<String>,
    /// TCP keep-alive period, seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Heartbeat interval on the control channel, seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Bound for every internal queue
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
    /// Set TCP_NODELAY on all sockets
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    /// Also run a UDP listener per mapping
    #[serde(default)]
    pub accept_udp: bool,
    /// Mux session tuning (tcpmux transport only)
    #[serde(default)]
    pub mux: MuxSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3080".to_string(),
            token: String::new(),
            transport: TransportMode::default(),
            ports: Vec::new(),
            keepalive_secs: default_keepalive_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            channel_size: default_channel_size(),
            nodelay: default_nodelay(),
            accept_udp: false,
            mux: MuxSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server tunnel address to dial
    pub remote_addr: String,
    /// Shared bearer token for the control-channel handshake
    pub token: String,
    /// Tunnel flavor, must match the server
    #[serde(default)]
    pub transport: TransportMode,
    /// TCP keep-alive period, seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Back-off between failed handshakes, seconds
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    /// Timeout on each outbound dial, seconds
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// Minimum number of pre-dialed tunnel connections
    #[serde(default = "default_conn_pool_size")]
    pub conn_pool_size: usize,
    /// Set TCP_NODELAY on all sockets
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    /// Mux session tuning (tcpmux transport only)
    #[serde(default)]
    pub mux: MuxSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_addr: "127.0.0.1:3080".to_string(),
            token: String::new(),
            transport: TransportMode::default(),
            keepalive_secs: default_keepalive_secs(),
            retry_interval_secs: default_retry_interval_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
            conn_pool_size: default_conn_pool_size(),
            nodelay: default_nodelay(),
            mux: MuxSettings::default(),
        }
    }
}

impl ClientConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// Mux session tuning, forwarded to the stream multiplexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxSettings {
    /// Streams per session before it retires
    #[serde(default = "default_mux_con")]
    pub mux_con: usize,
    /// Protocol compatibility version (1 or 2)
    #[serde(default = "default_mux_version")]
    pub mux_version: u8,
    /// Maximum payload bytes per frame
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Session receive buffer capacity
    #[serde(default = "default_max_receive_buffer")]
    pub max_receive_buffer: usize,
    /// Per-stream flow-control window
    #[serde(default = "default_max_stream_buffer")]
    pub max_stream_buffer: u32,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            mux_con: default_mux_con(),
            mux_version: default_mux_version(),
            max_frame_size: default_max_frame_size(),
            max_receive_buffer: default_max_receive_buffer(),
            max_stream_buffer: default_max_stream_buffer(),
        }
    }
}

impl MuxSettings {
    /// Session-layer view of these settings.
    pub fn session_config(&self) -> MuxConfig {
        MuxConfig {
            version: self.mux_version,
            max_frame_size: self.max_frame_size,
            max_receive_buffer: self.max_receive_buffer,
            max_stream_buffer: self.max_stream_buffer,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

fn default_keepalive_secs() -> u64 {
    75
}

fn default_heartbeat_secs() -> u64 {
    40
}

fn default_channel_size() -> usize {
    2048
}

fn default_nodelay() -> bool {
    true
}

fn default_retry_interval_secs() -> u64 {
    3
}

fn default_dial_timeout_secs() -> u64 {
    10
}

fn default_conn_pool_size() -> usize {
    8
}

fn default_mux_con() -> usize {
    8
}

fn default_mux_version() -> u8 {
    1
}

fn default_max_frame_size() -> usize {
    32768
}

fn default_max_receive_buffer() -> usize {
    4194304
}

fn default_max_stream_buffer() -> u32 {
    65536
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig {
            token: "change-me".to_string(),
            ports: vec!["8080=9090".to_string()],
            ..ServerConfig::default()
        }),
        client: Some(ClientConfig {
            token: "change-me".to_string(),
            ..ClientConfig::default()
        }),
        logging: LoggingConfig::default(),
    }
}
