//! Run startup recovery on the store.

use anyhow::Result;
use tidings_sync_client::{MessageStore, RecoveryReport};

use super::open_store;
use crate::config::CliConfig;

/// Run the recover command.
pub async fn run(config: &CliConfig) -> Result<RecoveryReport> {
    let store = open_store(config).await?;
    let report = store.recover().await?;
    println!(
        "Recovered: {} message(s) requeued, {} topic(s) detached",
        report.reset_syncing, report.detached_topics
    );
    Ok(report)
}
