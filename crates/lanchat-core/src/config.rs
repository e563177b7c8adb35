//! Configuration for a lanchat node.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LANCHAT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/lanchat/config.toml
//!   3. ~/.config/lanchat/config.toml

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::wire::{DEFAULT_MULTICAST_ADDR, HISTORY_CAPACITY};

/// Lowest TCP port the front-end may configure. 0 is also accepted and
/// means OS-assigned.
pub const MIN_TCP_PORT: u16 = 1024;

/// Maximum username length in characters.
pub const MAX_USERNAME_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),

    #[error("username must be 1-{MAX_USERNAME_LEN} characters with no whitespace, got {0:?}")]
    InvalidUsername(String),

    #[error("tcp port {0} is reserved; use {MIN_TCP_PORT}-65535, or 0 for os-assigned")]
    InvalidPort(u16),

    #[error("{0:?} is not a valid socket address")]
    InvalidAddress(String),

    #[error("{0} is not a multicast group")]
    NotMulticast(SocketAddr),
}

/// Everything the engine needs to come up, as provided by the front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Display name, 1-20 characters, no whitespace.
    pub username: String,
    /// TCP listen port for chat connections. 0 = OS-assigned.
    pub tcp_port: u16,
    /// Multicast group for peer discovery, `ip:port`.
    pub multicast_addr: String,
    /// Message history capacity. 0 = default (1000).
    pub history_capacity: usize,
    /// Optional append-only debug log file.
    pub log_file: Option<PathBuf>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            username: "anon".to_string(),
            tcp_port: 8080,
            multicast_addr: DEFAULT_MULTICAST_ADDR.to_string(),
            history_capacity: HISTORY_CAPACITY,
            log_file: None,
        }
    }
}

impl ChatConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LANCHAT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_username(&self.username)?;
        if self.tcp_port != 0 && self.tcp_port < MIN_TCP_PORT {
            return Err(ConfigError::InvalidPort(self.tcp_port));
        }
        let addr = self.multicast_group()?;
        if !addr.ip().is_multicast() {
            return Err(ConfigError::NotMulticast(addr));
        }
        Ok(())
    }

    /// The parsed multicast group address.
    pub fn multicast_group(&self) -> Result<SocketAddr, ConfigError> {
        self.multicast_addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.multicast_addr.clone()))
    }

    /// Apply LANCHAT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LANCHAT_USERNAME") {
            self.username = v;
        }
        if let Ok(v) = std::env::var("LANCHAT_PORT") {
            if let Ok(p) = v.parse() {
                self.tcp_port = p;
            }
        }
        if let Ok(v) = std::env::var("LANCHAT_MULTICAST") {
            self.multicast_addr = v;
        }
    }
}

/// Shared username rule: 1-20 characters, no whitespace.
pub fn validate_username(name: &str) -> Result<(), ConfigError> {
    let len = name.chars().count();
    if len == 0 || len > MAX_USERNAME_LEN || name.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidUsername(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        ChatConfig::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn username_rules() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username(&"x".repeat(20)).is_ok());

        assert!(validate_username("").is_err());
        assert!(validate_username(&"x".repeat(21)).is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username("tab\there").is_err());
    }

    #[test]
    fn low_ports_are_rejected_but_zero_is_allowed() {
        let mut config = ChatConfig::default();
        config.tcp_port = 80;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPort(80))));

        config.tcp_port = 0;
        assert!(config.validate().is_ok());

        config.tcp_port = 1024;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn multicast_address_is_required() {
        let mut config = ChatConfig::default();
        config.multicast_addr = "127.0.0.1:9999".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::NotMulticast(_))));

        config.multicast_addr = "not an address".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAddress(_))));

        config.multicast_addr = "239.255.42.1:17000".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_from_reads_toml() {
        let dir = std::env::temp_dir().join(format!("lanchat-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            "username = \"carol\"\ntcp_port = 9100\nmulticast_addr = \"224.0.0.1:9999\"\n",
        )
        .unwrap();

        let config = ChatConfig::load_from(&path).expect("load_from should succeed");
        assert_eq!(config.username, "carol");
        assert_eq!(config.tcp_port, 9100);
        assert_eq!(config.history_capacity, HISTORY_CAPACITY);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_from_rejects_bad_toml() {
        let dir = std::env::temp_dir().join(format!("lanchat-badcfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "username = [not toml").unwrap();

        assert!(matches!(
            ChatConfig::load_from(&path),
            Err(ConfigError::ParseFailed(..))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("lanchat")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
