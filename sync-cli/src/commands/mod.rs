//! CLI command implementations.

use anyhow::{Context, Result};
use std::sync::Arc;
use tidings_sync_client::{ChatClient, MockTransport, SqliteStore};
use tidings_sync_types::Message;

use crate::config::CliConfig;

pub mod draft;
pub mod history;
pub mod queued;
pub mod recover;
pub mod send;
pub mod topics;

/// Open the configured store.
pub async fn open_store(config: &CliConfig) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::new(&config.database)
        .await
        .with_context(|| format!("Failed to open {}", config.database.display()))?;
    Ok(Arc::new(store))
}

/// Start an engine session over the configured store.
///
/// Starting runs startup recovery, so interrupted transmissions are queued
/// again before any command sees the store.
pub async fn start_client(
    config: &CliConfig,
    transport: MockTransport,
) -> Result<ChatClient<MockTransport>> {
    let store = open_store(config).await?;
    ChatClient::start(store, transport, config.client.clone())
        .await
        .context("Failed to start session")
}

/// One line per message.
pub fn format_message(msg: &Message) -> String {
    let seq = msg
        .seq
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    let body = msg
        .content
        .as_text()
        .map(str::to_owned)
        .unwrap_or_else(|| msg.content.as_value().to_string());
    let pending = if msg.pending_delete { " (delete pending)" } else { "" };
    format!(
        "{:>6} {:>6} {:<11} {:<10} {}{}",
        msg.id.value(),
        seq,
        format!("{:?}", msg.state),
        msg.from.as_str(),
        body,
        pending
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// A config whose database lives in a fresh temporary directory.
    pub fn temp_config() -> (TempDir, CliConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load(None, dir.path()).unwrap();
        (dir, config)
    }
}
