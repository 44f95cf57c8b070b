//! Configuration management for the tidings CLI.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tidings_sync_client::ClientConfig;

/// Resolved settings for one CLI invocation.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Engine configuration.
    pub client: ClientConfig,
    /// Absolute location of the message database.
    pub database: PathBuf,
}

impl CliConfig {
    /// Load the engine configuration and place the database.
    ///
    /// Without a config file every setting takes its default. A relative
    /// database path is resolved against `data_dir`.
    pub fn load(config_file: Option<&Path>, data_dir: &Path) -> Result<Self> {
        let client = match config_file {
            Some(path) => ClientConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ClientConfig::default(),
        };

        let database = if client.storage.database.is_absolute() {
            client.storage.database.clone()
        } else {
            data_dir.join(&client.storage.database)
        };

        Ok(Self { client, database })
    }
}

/// Set directory permissions to 0700 (owner only) on Unix.
/// No-op on non-Unix platforms.
pub async fn set_dir_permissions_0700(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to set directory permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
