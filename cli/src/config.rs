// Configuration management for the punch CLI
//
// Cross-platform config stored in:
// - macOS: ~/.config/holepunch/config.json
// - Linux: ~/.config/holepunch/config.json
// - Windows: %APPDATA%\holepunch\config.json

use anyhow::{Context, Result};
use holepunch_core::{ClientConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Rendezvous server the client targets
    pub server_addr: String,

    /// Address the server binds when running `punch serve`
    pub bind_addr: String,

    /// UDP buffer size in bytes
    pub buffer_size: usize,

    /// Heartbeat interval in seconds
    pub heartbeat_secs: u64,

    /// Overall server-unreachable timeout in seconds
    pub connect_timeout_secs: u64,

    /// Server-side stale-entry eviction window in seconds (unset = entries
    /// are kept forever)
    pub stale_after_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:5555".to_string(),
            bind_addr: "0.0.0.0:5555".to_string(),
            buffer_size: 1024,
            heartbeat_secs: 45,
            connect_timeout_secs: 8,
            stale_after_secs: None,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("holepunch");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, writing defaults there on first use
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "server_addr" => {
                value
                    .parse::<SocketAddr>()
                    .context("Invalid socket address")?;
                self.server_addr = value.to_string();
            }
            "bind_addr" => {
                value
                    .parse::<SocketAddr>()
                    .context("Invalid socket address")?;
                self.bind_addr = value.to_string();
            }
            "buffer_size" => {
                self.buffer_size = value.parse().context("Invalid number")?;
            }
            "heartbeat_secs" => {
                self.heartbeat_secs = value.parse().context("Invalid number")?;
            }
            "connect_timeout_secs" => {
                self.connect_timeout_secs = value.parse().context("Invalid number")?;
            }
            "stale_after_secs" => {
                self.stale_after_secs = if value.is_empty() || value == "off" {
                    None
                } else {
                    Some(value.parse().context("Invalid number")?)
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.save()?;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "server_addr" => Some(self.server_addr.clone()),
            "bind_addr" => Some(self.bind_addr.clone()),
            "buffer_size" => Some(self.buffer_size.to_string()),
            "heartbeat_secs" => Some(self.heartbeat_secs.to_string()),
            "connect_timeout_secs" => Some(self.connect_timeout_secs.to_string()),
            "stale_after_secs" => Some(
                self.stale_after_secs
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "off".to_string()),
            ),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        [
            "server_addr",
            "bind_addr",
            "buffer_size",
            "heartbeat_secs",
            "connect_timeout_secs",
            "stale_after_secs",
        ]
        .iter()
        .map(|key| (key.to_string(), self.get(key).unwrap_or_default()))
        .collect()
    }

    /// Build the core client configuration
    pub fn client_config(&self) -> Result<ClientConfig> {
        let server_addr: SocketAddr = self
            .server_addr
            .parse()
            .context("Invalid server_addr in config")?;
        let mut config = ClientConfig::new(server_addr);
        config.buffer_size = self.buffer_size;
        config.heartbeat_interval = Duration::from_secs(self.heartbeat_secs);
        config.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        Ok(config)
    }

    /// Build the core server configuration
    pub fn server_config(&self) -> Result<ServerConfig> {
        let bind_addr: SocketAddr = self
            .bind_addr
            .parse()
            .context("Invalid bind_addr in config")?;
        Ok(ServerConfig {
            bind_addr,
            buffer_size: self.buffer_size,
            stale_after: self.stale_after_secs.map(Duration::from_secs),
        })
    }
}
