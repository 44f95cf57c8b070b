//! Show messages waiting to be transmitted.

use anyhow::Result;
use tidings_sync_client::MessageStore;
use tidings_sync_types::TopicName;

use super::{format_message, open_store};
use crate::config::CliConfig;

/// Run the queued command.
pub async fn run(config: &CliConfig, topic: &TopicName) -> Result<()> {
    let store = open_store(config).await?;
    let queued = store.queued_messages(topic).await?;
    let soft = store.queued_deletes(topic, false).await?;
    let hard = store.queued_deletes(topic, true).await?;

    println!("Queued for {}: {} message(s)", topic, queued.len());
    for msg in &queued {
        println!("{}", format_message(msg));
    }
    if !soft.is_empty() || !hard.is_empty() {
        println!();
        println!("Pending deletes: {} soft, {} hard", soft.len(), hard.len());
    }

    Ok(())
}
