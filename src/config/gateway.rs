//! Gateway configuration
//!
//! Loads settings from an optional TOML file and layers command line / environment
//! overrides on top.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::backend::{BackendError, BackendSettings};
use crate::server::{ServerConfig, DEFAULT_MAX_MESSAGE_SIZE};

/// Configuration file name
pub const CONFIG_FILE: &str = "gateway.toml";

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted WebSocket message in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Seconds a client has to send its request head
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_handshake_timeout_secs() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_message_size: default_max_message_size(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

/// Event routing settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EventsSection {
    /// Inbound event names submitted to the backend
    #[serde(default)]
    pub forward: Vec<String>,
}

/// Values given on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
}

/// Complete gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub events: EventsSection,
}

impl GatewayConfig {
    /// Load configuration from a file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply command line / environment values on top of the file
    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(bind) = overrides.bind {
            self.server.bind = bind;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(redis_url) = overrides.redis_url {
            self.backend.redis_url = redis_url;
        }
        if let Some(database_url) = overrides.database_url {
            self.backend.database_url = database_url;
        }
        self
    }

    /// Check values that would otherwise fail later at startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "server.max_message_size must be greater than 0".to_string(),
            ));
        }
        if self.server.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.handshake_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if let Some(name) = self.events.forward.iter().find(|n| n.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "events.forward contains an invalid name '{}'",
                name
            )));
        }
        self.backend.validate().map_err(|e| match e {
            BackendError::InvalidSettings(msg) => ConfigError::Invalid(msg),
            other => ConfigError::Invalid(other.to_string()),
        })
    }

    /// Listener configuration
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.server.bind.clone(), self.server.port)
            .with_max_message_size(self.server.max_message_size)
            .with_handshake_timeout(Duration::from_secs(self.server.handshake_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.backend.redis_url, "redis://localhost:6379");
        assert_eq!(config.backend.database_url, "");
        assert!(config.events.forward.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let dir = tempdir().unwrap();
        let config = GatewayConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
[server]
port = 5000

[events]
forward = ["score", "answer"]
"#,
        )
        .unwrap();

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.bind, DEFAULT_BIND);
        assert_eq!(config.backend, BackendSettings::default());
        assert_eq!(config.events.forward, vec!["score", "answer"]);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[server\nport = ").unwrap();

        let result = GatewayConfig::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_overrides_win() {
        let config = GatewayConfig::default().apply(Overrides {
            port: Some(8080),
            redis_url: Some("redis://cache:6379".to_string()),
            ..Default::default()
        });
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, DEFAULT_BIND);
        assert_eq!(config.backend.redis_url, "redis://cache:6379");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GatewayConfig::default();
        config.backend.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.server.max_message_size = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.events.forward.push(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config() {
        let mut config = GatewayConfig::default();
        config.server.bind = "127.0.0.1".to_string();
        let server = config.server_config();
        assert_eq!(server.socket_addr(), "127.0.0.1:4000");
        assert_eq!(server.handshake_timeout, Duration::from_secs(10));
    }
}
