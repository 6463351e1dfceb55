//! Configuration handling for the VPN launcher

use crate::credentials::Protocol;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub vpn: VpnConfig,
    #[serde(default)]
    pub openconnect: OpenConnectConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VpnConfig {
    pub portal: String,
    pub protocol: Protocol,
    pub samlv2: bool,
    pub username: Option<String>,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            portal: String::new(),
            protocol: Protocol::AnyConnect,
            samlv2: true,
            username: None,
        }
    }
}

/// How the privileged openconnect process is started and stopped
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OpenConnectConfig {
    pub binary: PathBuf,
    pub sudo: PathBuf,
    pub pid_file: PathBuf,
    pub kill_timeout_secs: u64,
}

impl Default for OpenConnectConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/local/bin/openconnect"),
            sudo: PathBuf::from("/usr/bin/sudo"),
            pid_file: PathBuf::from(crate::openconnect::DEFAULT_PID_FILE),
            kill_timeout_secs: 5,
        }
    }
}

impl OpenConnectConfig {
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Upper bound on how long the web login may stay open
    pub web_auth_timeout_secs: u64,
    /// Delay before the login window is closed after a cookie arrives
    pub settle_delay_ms: u64,
    pub use_keyring: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            web_auth_timeout_secs: 300,
            settle_delay_ms: 1000,
            use_keyring: true,
        }
    }
}

impl AuthConfig {
    pub fn web_auth_timeout(&self) -> Duration {
        Duration::from_secs(self.web_auth_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// `<config dir>/vpn-launcher/config.toml`, or `vpn-launcher.toml` when
    /// the platform has no config directory
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("vpn-launcher").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("vpn-launcher.toml"))
    }
}
