//! Configuration management for camlink

use crate::webrtc::ice_servers::IceServer;
use crate::webrtc::monitor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Signaling server and identity
    #[serde(default)]
    pub server: ServerConfig,

    /// Control channel reconnect policy
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Media link configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Liveness monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket endpoint of the shared control channel
    #[serde(default = "default_server_url")]
    pub url: String,

    /// Local viewer identity
    #[serde(default)]
    pub identity: Option<String>,

    /// Bearer credential sent on connect and in the init frame
    #[serde(default)]
    pub token: Option<String>,

    /// `to` field of the init frame
    #[serde(default = "default_init_target")]
    pub init_target: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            identity: None,
            token: None,
            init_target: default_init_target(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Consecutive failed connects before giving up
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Fixed delay between connects
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Query parameter carrying the bearer token on connect
    #[serde(default = "default_auth_query_param")]
    pub auth_query_param: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            auth_query_param: default_auth_query_param(),
        }
    }
}

impl ChannelConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// Static ICE servers, used when no relay endpoint is configured or it fails
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,

    /// Endpoint returning `{"iceServers": ...}` relay credentials
    #[serde(default)]
    pub relay_credentials_url: Option<String>,

    /// Open the auxiliary control data channel
    #[serde(default = "default_control_channel")]
    pub control_channel: bool,

    /// Label of the auxiliary control data channel
    #[serde(default = "default_control_channel_label")]
    pub control_channel_label: String,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            relay_credentials_url: None,
            control_channel: default_control_channel(),
            control_channel_label: default_control_channel_label(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Stats sampling cadence
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,

    /// Silence before a session is flagged "no data"
    #[serde(default = "default_stall_threshold_ms")]
    pub stall_threshold_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval_ms(),
            stall_threshold_ms: default_stall_threshold_ms(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file; a missing file yields defaults
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.server.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(
                "server.url must be a ws:// or wss:// URL".into(),
            ));
        }

        if let Some(identity) = &self.server.identity {
            if identity.trim().is_empty() {
                return Err(ConfigError::Invalid("server.identity must not be blank".into()));
            }
        }

        if self.server.init_target.is_empty() {
            return Err(ConfigError::Invalid("server.init_target must not be empty".into()));
        }

        if self.channel.reconnect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "channel.reconnect_attempts must be at least 1".into(),
            ));
        }

        if self.channel.auth_query_param.is_empty() {
            return Err(ConfigError::Invalid("channel.auth_query_param must not be empty".into()));
        }

        if self.webrtc.control_channel && self.webrtc.control_channel_label.is_empty() {
            return Err(ConfigError::Invalid(
                "webrtc.control_channel_label must not be empty".into(),
            ));
        }

        if let Some(url) = &self.webrtc.relay_credentials_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(
                    "webrtc.relay_credentials_url must be an http(s) URL".into(),
                ));
            }
        }

        for server in &self.webrtc.ice_servers {
            if server.urls.is_empty() {
                return Err(ConfigError::Invalid("every ICE server needs at least one URL".into()));
            }
        }

        if self.monitor.interval_ms == 0 {
            return Err(ConfigError::Invalid("monitor.interval_ms must be non-zero".into()));
        }

        if self.monitor.stall_threshold_ms < self.monitor.interval_ms {
            return Err(ConfigError::Invalid(
                "monitor.stall_threshold_ms cannot be shorter than monitor.interval_ms".into(),
            ));
        }

        Ok(())
    }
}


fn default_server_url() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_init_target() -> String {
    "server".to_string()
}

fn default_reconnect_attempts() -> u32 { 20 }
fn default_reconnect_interval_ms() -> u64 { 5000 }

fn default_auth_query_param() -> String {
    "auth".to_string()
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}

fn default_control_channel() -> bool {
    true
}

fn default_control_channel_label() -> String {
    "control".to_string()
}

fn default_monitor_interval_ms() -> u64 {
    monitor::DEFAULT_INTERVAL.as_millis() as u64
}
fn default_stall_threshold_ms() -> u64 {
    monitor::DEFAULT_STALL_THRESHOLD.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}
