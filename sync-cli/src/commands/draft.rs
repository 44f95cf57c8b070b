//! Save a draft.

use anyhow::Result;
use tidings_sync_client::MockTransport;
use tidings_sync_types::{Content, DbId, TopicName};

use super::start_client;
use crate::config::CliConfig;

/// Run the draft command.
pub async fn run(config: &CliConfig, topic: &TopicName, text: &str) -> Result<DbId> {
    let client = start_client(config, MockTransport::new()).await?;
    let id = client.save_draft(topic, Content::text(text)).await?;
    println!("Saved draft {} in {}", id, topic);
    Ok(id)
}
