//! Show cached history for a topic.

use anyhow::Result;
use tidings_sync_client::MessageStore;
use tidings_sync_types::TopicName;

use super::{format_message, open_store};
use crate::config::CliConfig;

/// Run the history command.
///
/// Prints the newest `limit` messages, oldest first.
pub async fn run(config: &CliConfig, topic: &TopicName, limit: u64) -> Result<()> {
    let store = open_store(config).await?;
    let mut messages = store.msg_query(topic, limit).await?;

    if messages.is_empty() {
        println!("No messages in {}", topic);
        return Ok(());
    }

    messages.reverse();
    for msg in &messages {
        println!("{}", format_message(msg));
    }
    let total = store.msg_count(topic).await?;
    println!();
    println!("{} of {} cached message(s)", messages.len(), total);

    Ok(())
}
