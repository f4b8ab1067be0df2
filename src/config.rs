//! Daemon configuration, loaded from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::permission;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:6600";
const DEFAULT_CONNECTION_TIMEOUT: u64 = 60;
const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_MAX_COMMAND_LIST_SIZE: usize = 2048;
const DEFAULT_MAX_OUTPUT_BUFFER_SIZE: usize = 8192;

/// Top-level daemon config.
///
/// The size limits are expressed in KiB, matching the configuration file
/// convention; [`Config::limits`] scales them to bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to listen on: `host:port`, or an absolute path for a Unix
    /// domain socket.
    pub bind_address: String,
    /// Seconds of inactivity after which a non-idle client is closed.
    pub connection_timeout: u64,
    /// Maximum number of simultaneous client connections.
    pub max_connections: usize,
    /// Maximum accumulated size of a command list, in KiB.
    pub max_command_list_size: usize,
    /// Maximum deferred output buffered for a slow client, in KiB.
    pub max_output_buffer_size: usize,
    /// Permissions granted to new connections.
    pub default_permissions: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_command_list_size: DEFAULT_MAX_COMMAND_LIST_SIZE,
            max_output_buffer_size: DEFAULT_MAX_OUTPUT_BUFFER_SIZE,
            default_permissions: vec![
                "read".to_string(),
                "add".to_string(),
                "control".to_string(),
                "admin".to_string(),
            ],
        }
    }
}

/// Session-layer limits in their working units (bytes, `Duration`).
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub connection_timeout: Duration,
    pub max_connections: usize,
    pub max_command_list_size: usize,
    pub max_output_buffer_size: usize,
}

/// Errors loading or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(std::path::PathBuf, std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    ParseFailed(std::path::PathBuf, toml::de::Error),
    #[error("{0} must be a positive integer")]
    NotPositive(&'static str),
    #[error("unknown permission name: {0}")]
    UnknownPermission(String),
}

impl Config {
    /// Load config from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero limits; serde already rejects negatives and non-integers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_timeout == 0 {
            return Err(ConfigError::NotPositive("connection_timeout"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::NotPositive("max_connections"));
        }
        if self.max_command_list_size == 0 {
            return Err(ConfigError::NotPositive("max_command_list_size"));
        }
        if self.max_output_buffer_size == 0 {
            return Err(ConfigError::NotPositive("max_output_buffer_size"));
        }
        self.default_permission_mask()?;
        Ok(())
    }

    /// Session-layer limits with KiB values scaled to bytes.
    pub fn limits(&self) -> Limits {
        Limits {
            connection_timeout: Duration::from_secs(self.connection_timeout),
            max_connections: self.max_connections,
            max_command_list_size: self.max_command_list_size * 1024,
            max_output_buffer_size: self.max_output_buffer_size * 1024,
        }
    }

    /// Permission mask seeded into new sessions.
    pub fn default_permission_mask(&self) -> Result<u32, ConfigError> {
        permission::mask_from_names(&self.default_permissions)
            .map_err(ConfigError::UnknownPermission)
    }
}
