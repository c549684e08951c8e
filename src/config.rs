use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::BridgeSettings;
use crate::connection::DEFAULT_OUTBOUND_CAPACITY;

/// Top-level bridge config, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub commands: CommandsConfig,
    pub downstream: DownstreamConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the HTTP/WebSocket listener.
    pub bind: SocketAddr,
    /// Name of the device-side program, used in user-facing errors.
    pub peer_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3055)),
            peer_name: "device plugin".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub default_timeout_ms: u64,
    /// Upper bound for caller-supplied timeouts.
    pub max_timeout_ms: u64,
    /// Forward methods with no registered handler verbatim.
    pub passthrough: bool,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_timeout_ms: 120_000,
            passthrough: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    /// Bounded writer queue per device session.
    pub outbound_queue_capacity: usize,
    /// Keepalive ping interval on device sockets; 0 disables pings.
    pub ping_interval_secs: u64,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: DEFAULT_OUTBOUND_CAPACITY,
            ping_interval_secs: 30,
        }
    }
}

impl BridgeConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Effective config as pretty TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.commands;
        if c.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "commands.default_timeout_ms must be positive".into(),
            ));
        }
        if c.max_timeout_ms < c.default_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "commands.max_timeout_ms ({}) is below default_timeout_ms ({})",
                c.max_timeout_ms, c.default_timeout_ms
            )));
        }
        if self.downstream.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "downstream.outbound_queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        match self.downstream.ping_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            default_timeout: Duration::from_millis(self.commands.default_timeout_ms),
            max_timeout: Duration::from_millis(self.commands.max_timeout_ms),
            outbound_capacity: self.downstream.outbound_queue_capacity,
            peer_name: self.server.peer_name.clone(),
        }
    }
}

/// `$XDG_CONFIG_HOME/docbridge/config.toml` (or the platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("docbridge").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    SerializeFailed(toml::ser::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
            Self::Invalid(detail) => write!(f, "Invalid config: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.server.bind.port(), 3055);
        assert!(config.commands.passthrough);
        assert_eq!(config.ping_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
            [commands]
            default_timeout_ms = 5000

            [downstream]
            ping_interval_secs = 0
        "#;
        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.commands.default_timeout_ms, 5000);
        assert_eq!(config.commands.max_timeout_ms, 120_000);
        assert_eq!(config.ping_interval(), None);
        assert_eq!(config.downstream.outbound_queue_capacity, 64);
    }

    #[test]
    fn bridge_settings_follow_config() {
        let mut config = BridgeConfig::default();
        config.commands.default_timeout_ms = 1500;
        config.server.peer_name = "Figma plugin".into();
        let settings = config.bridge_settings();
        assert_eq!(settings.default_timeout, Duration::from_millis(1500));
        assert_eq!(settings.max_timeout, Duration::from_secs(120));
        assert_eq!(settings.peer_name, "Figma plugin");
    }

    #[test]
    fn validate_rejects_inverted_timeouts() {
        let mut config = BridgeConfig::default();
        config.commands.max_timeout_ms = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = BridgeConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nbind = 1").unwrap();
        let err = BridgeConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn effective_config_reparses() {
        let mut config = BridgeConfig::default();
        config.server.bind = "0.0.0.0:9000".parse().unwrap();
        let text = config.to_toml().unwrap();
        assert!(text.contains("[commands]"));
        let reparsed: BridgeConfig = toml::from_str(&text).unwrap();
        assert_eq!(reparsed, config);
    }
}
