//! socketchat CLI configuration
//!
//! Configuration is read from a TOML file, either the path given with
//! `--config` or `~/.socketchat/config.toml` when that file exists. Missing
//! sections and fields fall back to their defaults. Command-line flags are
//! applied on top with `apply_overrides`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use socketchat_client::ClientConfig;
use socketchat_core::wire::DEFAULT_MAX_FRAME_SIZE;

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the socketchat CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Connection settings shared with the client library
    pub client: ClientConfig,

    /// Interactive interface settings
    pub cli: CliConfig,

    /// Development relay settings
    pub relay: RelayConfig,
}

/// Interactive interface settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Prompt printed before each input line in chat mode
    pub prompt: String,

    /// Prefix inbound messages with their timestamp
    pub show_timestamps: bool,
}

/// Development relay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the relay listens on
    pub bind_addr: String,

    /// Largest accepted frame from a client
    pub max_frame_size: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            prompt: "> ".to_string(),
            show_timestamps: true,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:6666".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

// ----------------------------------------------------------------------------
// Loading and Saving
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `~/.socketchat/config.toml` if it exists, defaults otherwise
    pub fn load_default() -> Result<Self> {
        match Self::default_config_path() {
            Some(path) if path.exists() => {
                info!("Loading configuration from: {}", path.display());
                Self::load_from_file(path)
            }
            _ => {
                debug!("No configuration file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".socketchat").join("config.toml"))
    }

    /// Save configuration to a specific file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CliError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Apply command-line overrides
    pub fn apply_overrides(&mut self, server: Option<String>, username: Option<String>) {
        if let Some(server) = server {
            self.client.server_addr = server;
        }
        if let Some(username) = username {
            self.client.username = username;
        }
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;

        if !self.relay.bind_addr.contains(':') {
            return Err(CliError::Config(format!(
                "Relay bind address must be host:port, got {}",
                self.relay.bind_addr
            )));
        }
        if self.relay.max_frame_size < 64 {
            return Err(CliError::Config(
                "Relay max frame size must be at least 64 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
