use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::types::Config;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

impl Config {
    /// Returns the path to the configuration file.
    ///
    /// Uses `~/.config/ssh-agent-switcher/config.toml` on Unix,
    /// falling back to the current directory if config_dir is unavailable.
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("ssh-agent-switcher").join("config.toml")
    }

    /// Loads configuration from the default config file.
    ///
    /// A missing file yields `Config::default()`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();

        if !path.exists() {
            return Ok(Config::default());
        }

        Self::load_from(&path)
    }

    /// Loads and parses configuration from an explicit path, which must exist.
    ///
    /// Validation is left to the caller so CLI overrides can be applied first.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Validates the configuration.
    ///
    /// Checks:
    /// - A socket path is configured or derivable from `$USER`
    /// - Timeouts are positive
    /// - The frame limit leaves room for a header and a type byte
    /// - The socket mode fits in permission bits
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path().is_none() {
            return Err(ConfigError::ValidationError {
                message: "socket path is empty: set --socket-path or $USER".to_string(),
            });
        }

        if self.backends.timeout_ms == 0 {
            return Err(ConfigError::ValidationError {
                message: "backends.timeout_ms must be greater than zero".to_string(),
            });
        }

        if self.switcher.drain_timeout_ms == 0 {
            return Err(ConfigError::ValidationError {
                message: "switcher.drain_timeout_ms must be greater than zero".to_string(),
            });
        }

        if self.backends.max_frame_len < 5 {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "backends.max_frame_len {} is too small",
                    self.backends.max_frame_len
                ),
            });
        }

        if self.switcher.socket_mode > 0o777 {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "switcher.socket_mode {:#o} is not a permission mask",
                    self.switcher.socket_mode
                ),
            });
        }

        Ok(())
    }
}
