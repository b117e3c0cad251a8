//! Client configuration
//!
//! Values come from `Default`, optionally overlaid with `SOCKETCHAT_*`
//! environment variables, or are embedded in the CLI's TOML file.

use serde::{Deserialize, Serialize};

use socketchat_core::wire::DEFAULT_MAX_FRAME_SIZE;
use socketchat_core::{ChatError, Result};

/// Environment variable overriding `server_addr`
pub const ENV_SERVER_ADDR: &str = "SOCKETCHAT_SERVER_ADDR";

/// Environment variable overriding `username`
pub const ENV_USERNAME: &str = "SOCKETCHAT_USERNAME";

/// Configuration for one socketchat connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address in `host:port` form
    pub server_addr: String,

    /// Identity used to attribute outgoing messages
    pub username: String,

    /// Largest accepted frame, excluding the 4-byte length prefix
    pub max_frame_size: usize,

    /// Upper bound on concurrent channel subscribers
    pub max_subscribers: usize,

    /// Messages a subscriber may leave undrained before it is pruned
    pub subscriber_queue_capacity: usize,

    /// Size of each socket read
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:6666".to_string(),
            username: default_username(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_subscribers: 16,
            subscriber_queue_capacity: 1024,
            read_buffer_size: 8 * 1024,
        }
    }
}

fn default_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "anonymous".to_string())
}

impl ClientConfig {
    /// Defaults overlaid with `SOCKETCHAT_SERVER_ADDR` and `SOCKETCHAT_USERNAME`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var(ENV_SERVER_ADDR) {
            config.server_addr = addr;
        }
        if let Ok(username) = std::env::var(ENV_USERNAME) {
            config.username = username;
        }
        config
    }

    pub fn with_server_addr(mut self, server_addr: impl Into<String>) -> Self {
        self.server_addr = server_addr.into();
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.server_addr.trim().is_empty() {
            return Err(ChatError::config_error("Server address must not be empty"));
        }
        if !self.server_addr.contains(':') {
            return Err(ChatError::config_error(format!(
                "Server address must be host:port, got {}",
                self.server_addr
            )));
        }
        if self.username.trim().is_empty() {
            return Err(ChatError::config_error("Username must not be empty"));
        }
        if self.max_frame_size < 64 || self.max_frame_size > u32::MAX as usize {
            return Err(ChatError::config_error(format!(
                "Max frame size must be between 64 and {} bytes",
                u32::MAX
            )));
        }
        if self.max_subscribers == 0 {
            return Err(ChatError::config_error(
                "Max subscribers must be greater than 0",
            ));
        }
        if self.subscriber_queue_capacity == 0 {
            return Err(ChatError::config_error(
                "Subscriber queue capacity must be greater than 0",
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(ChatError::config_error(
                "Read buffer size must be greater than 0",
            ));
        }
        Ok(())
    }
}
