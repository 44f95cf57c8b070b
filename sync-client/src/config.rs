//! Configuration loading for the sync engine.
//!
//! Configuration is loaded from a TOML file (default: `tidings.toml`).
//! Every section and key is optional.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a chat client session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Session configuration.
    #[serde(default)]
    pub session: SessionConfig,
    /// History paging configuration.
    #[serde(default)]
    pub paging: PagingConfig,
    /// Synchronization behavior.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Local storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Id of the local user (default: "me").
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Seconds to wait for the server to answer a request (default: 10).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// History paging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PagingConfig {
    /// Messages per page (default: 20).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

/// Synchronization behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Transmit queued messages right after a topic attaches (default: true).
    #[serde(default = "default_true")]
    pub flush_on_attach: bool,
    /// Acknowledge every inbound message as received (default: true).
    #[serde(default = "default_true")]
    pub mark_recv_on_data: bool,
}

/// Local storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

// Default value functions
fn default_user_id() -> String {
    "me".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_page_size() -> u32 {
    tidings_sync_core::DEFAULT_PAGE_SIZE
}

fn default_true() -> bool {
    true
}

fn default_database_path() -> PathBuf {
    PathBuf::from("tidings.db")
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_on_attach: default_true(),
            mark_recv_on_data: default_true(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Set the local user id.
    pub fn with_user(mut self, user_id: &str) -> Self {
        self.session.user_id = user_id.to_string();
        self
    }

    /// Set the page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.paging.page_size = page_size;
        self
    }

    /// How long to wait for a request's control response.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.session.request_timeout_secs)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
