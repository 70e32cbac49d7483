//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RPCWIRE_CONFIG)
//! 3. Environment variables
//!
//! Timeouts are given in milliseconds; zero disables the timeout.

use crate::server::ServerConfig;
use rpcwire_protocol::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Graceful shutdown configuration.
    pub shutdown: ShutdownConfig,
    /// Protocol served by the binary.
    pub protocol: ProtocolConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RPCWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.shutdown.apply_env_overrides();
        self.protocol.apply_env_overrides();
    }

    /// Checks values that would make the server unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_message_size must be greater than zero".to_string(),
            ));
        }
        if let Some(ref path) = self.protocol.path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(
                    "protocol.path is empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Builds the runtime server configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.network.bind_addr,
            read_timeout: self.network.read_timeout(),
            write_timeout: self.network.write_timeout(),
            idle_timeout: self.network.idle_timeout(),
            max_message_size: self.network.max_message_size,
            new_conn_grace: self.network.new_conn_grace(),
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
    /// Time allowed to read one message.
    pub read_timeout_ms: u64,
    /// Time allowed to write one response.
    pub write_timeout_ms: u64,
    /// Time an idle connection waits for its next message. Zero falls back
    /// to the read timeout.
    pub idle_timeout_ms: u64,
    /// Largest logical message accepted, in bytes.
    pub max_message_size: usize,
    /// Age after which a connection that never sent a message may be closed
    /// by a graceful shutdown. Zero never closes such connections.
    pub new_conn_grace_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            idle_timeout_ms: 300_000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            new_conn_grace_ms: 5_000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("RPCWIRE_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        override_from_env("RPCWIRE_READ_TIMEOUT_MS", &mut self.read_timeout_ms);
        override_from_env("RPCWIRE_WRITE_TIMEOUT_MS", &mut self.write_timeout_ms);
        override_from_env("RPCWIRE_IDLE_TIMEOUT_MS", &mut self.idle_timeout_ms);
        override_from_env("RPCWIRE_MAX_MESSAGE_SIZE", &mut self.max_message_size);
        override_from_env("RPCWIRE_NEW_CONN_GRACE_MS", &mut self.new_conn_grace_ms);
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn new_conn_grace(&self) -> Duration {
        Duration::from_millis(self.new_conn_grace_ms)
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time allowed for in-flight calls to finish.
    pub timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl ShutdownConfig {
    fn apply_env_overrides(&mut self) {
        override_from_env("RPCWIRE_SHUTDOWN_TIMEOUT_MS", &mut self.timeout_ms);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Protocol configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Path to a JSON protocol declaration. The built-in echo protocol is
    /// served when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("RPCWIRE_PROTOCOL") {
            self.path = Some(PathBuf::from(path));
        }
    }

    /// Reads the protocol text, if a path is configured.
    pub fn read(&self) -> Result<Option<String>, ConfigError> {
        match self.path {
            Some(ref path) => std::fs::read_to_string(path)
                .map(Some)
                .map_err(|e| ConfigError::IoError(path.clone(), e)),
            None => Ok(None),
        }
    }
}

fn override_from_env<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
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
