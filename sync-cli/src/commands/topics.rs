//! List known topics.

use anyhow::Result;
use tidings_sync_client::MessageStore;
use tidings_sync_types::Seq;

use super::open_store;
use crate::config::CliConfig;

fn show(seq: Option<Seq>) -> String {
    seq.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Run the topics command.
pub async fn run(config: &CliConfig) -> Result<()> {
    let store = open_store(config).await?;
    let topics = store.topic_get_all().await?;

    if topics.is_empty() {
        println!("No topics in {}", config.database.display());
        return Ok(());
    }

    println!(
        "{:<20} {:>6} {:>6} {:>6} {:>7} {:>7} {:>6}",
        "TOPIC", "RECV", "READ", "MAX", "CACHED", "QUEUED", "LOADED"
    );
    for topic in topics {
        let cached = store.msg_count(&topic.name).await?;
        let queued = store.queued_messages(&topic.name).await?.len();
        println!(
            "{:<20} {:>6} {:>6} {:>6} {:>7} {:>7} {:>6}",
            topic.name.as_str(),
            show(topic.recv),
            show(topic.read),
            show(topic.max_seq),
            cached,
            queued,
            if topic.all_loaded { "all" } else { "" }
        );
    }

    Ok(())
}
