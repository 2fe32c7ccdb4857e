//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via OSNET_CONFIG)
//! 3. Environment variables

use crate::server::ServerConfig;
use osnet_protocol::{DEFAULT_PORT, MAX_PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Remote stream configuration.
    pub streams: StreamsConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("OSNET_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Parse(_, msg) => ConfigError::Parse(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(PathBuf::new(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.streams.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks values that would make the server unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::Validation(
                "network.max_connections must be at least 1".to_string(),
            ));
        }
        self.streams.validate()?;
        if self.metrics.enabled && self.metrics.bind_addr == self.network.bind_addr {
            return Err(ConfigError::Validation(format!(
                "metrics and protocol listeners both bind {}",
                self.network.bind_addr
            )));
        }
        Ok(())
    }

    /// Builds the listener settings for [`crate::Server`]. Metrics are attached separately.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.network.bind_addr,
            idle_timeout: self.network.idle_timeout(),
            max_connections: self.network.max_connections,
            metrics: None,
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_parse("OSNET_BIND") {
            self.bind_addr = addr;
        }
        if let Some(secs) = env_parse("OSNET_IDLE_TIMEOUT") {
            self.idle_timeout_secs = secs;
        }
        if let Some(n) = env_parse("OSNET_MAX_CONNECTIONS") {
            self.max_connections = n;
        }
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Remote stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// Directory served by `file:` locators. `None` disables them.
    pub root_dir: Option<PathBuf>,
    /// Open handles one session may hold at once.
    pub max_handles_per_session: usize,
    /// Upper bound on the bytes returned by one read.
    pub max_read_chunk: u32,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            max_handles_per_session: 256,
            max_read_chunk: 64 * 1024,
        }
    }
}

impl StreamsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("OSNET_STREAM_ROOT") {
            self.root_dir = if dir.is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
        if let Some(n) = env_parse("OSNET_MAX_HANDLES") {
            self.max_handles_per_session = n;
        }
        if let Some(n) = env_parse("OSNET_MAX_READ_CHUNK") {
            self.max_read_chunk = n;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_handles_per_session == 0 {
            return Err(ConfigError::Validation(
                "streams.max_handles_per_session must be at least 1".to_string(),
            ));
        }
        // Leave room for the frame header inside the payload limit
        if self.max_read_chunk == 0 || self.max_read_chunk > MAX_PAYLOAD_SIZE / 2 {
            return Err(ConfigError::Validation(format!(
                "streams.max_read_chunk must be between 1 and {}",
                MAX_PAYLOAD_SIZE / 2
            )));
        }
        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("OSNET_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.eq_ignore_ascii_case("true");
        }
        if let Some(addr) = env_parse("OSNET_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Serde helpers for SocketAddr (kept as a string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
