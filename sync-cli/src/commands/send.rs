//! Send a message.

use anyhow::{Context, Result};
use tidings_sync_client::{MessageStore, MockTransport};
use tidings_sync_types::{
    ClientMessage, Content, Ctrl, CtrlParams, DbId, Seq, ServerMessage, TopicName,
};

use super::start_client;
use crate::config::CliConfig;

/// Run the send command.
///
/// The message is always queued first. With `use_mock` a local loopback
/// server accepts the subscribe and every queued message for the topic is
/// flushed to it in order.
pub async fn run(
    config: &CliConfig,
    topic: &TopicName,
    text: &str,
    use_mock: bool,
) -> Result<DbId> {
    if !use_mock {
        let client = start_client(config, MockTransport::new()).await?;
        let id = client.send(topic, Content::text(text)).await?;
        println!("Queued message {} in {} (no server connection)", id, topic);
        return Ok(id);
    }

    let transport = MockTransport::connected();
    let client = start_client(config, transport.clone()).await?;
    let next_seq = client
        .session()
        .store()
        .topic_get(topic)
        .await?
        .and_then(|t| t.max_seq)
        .map(|s| s.value() + 1)
        .unwrap_or(1);
    transport.set_responder(loopback_server(next_seq));

    let id = client.send(topic, Content::text(text)).await?;
    client
        .attach(topic)
        .await
        .with_context(|| format!("Failed to attach to {}", topic))?;

    let published = transport
        .sent_client_messages()
        .iter()
        .filter(|m| matches!(m, ClientMessage::Pub(_)))
        .count();
    let msg = client
        .session()
        .store()
        .msg_get(topic, id)
        .await?
        .context("Sent message disappeared")?;
    match msg.seq {
        Some(seq) => println!(
            "Sent message {} in {} as seq {} ({} published)",
            id, topic, seq, published
        ),
        None => println!("Message {} in {} is still queued", id, topic),
    }
    Ok(id)
}

/// Accepts every request and numbers publishes from `first_seq`.
fn loopback_server(first_seq: u64) -> impl FnMut(&ClientMessage) -> Vec<ServerMessage> + Send {
    let mut next_seq = first_seq;
    move |msg| {
        let seq = match msg {
            ClientMessage::Note(_) => return vec![],
            ClientMessage::Pub(_) => {
                let seq = Seq::new(next_seq);
                next_seq += 1;
                Some(seq)
            }
            _ => None,
        };
        vec![ServerMessage::Ctrl(Ctrl {
            id: msg.id().map(str::to_owned),
            topic: Some(msg.topic().clone()),
            code: 200,
            text: "ok".into(),
            ts: tidings_sync_types::now_millis(),
            params: CtrlParams { seq, url: None },
        })]
    }
}
