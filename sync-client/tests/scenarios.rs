//! End-to-end engine scenarios against the in-memory store and the mock
//! transport.
//!
//! Each test plays the server through a responder closure and checks the
//! persisted state afterwards, never the engine's internals.

use std::sync::Arc;

use tidings_sync_client::{
    ChatClient, ClientConfig, ClientError, ClientEvent, MemoryStore, MessageStore, MockTransport,
    Refresh, SqliteStore,
};
use tidings_sync_types::{
    ClientMessage, Content, Ctrl, CtrlParams, DataEvent, InfoEvent, InfoWhat, Message,
    MessageState, Seq, SeqRange, ServerMessage, TopicName, UserId,
};

fn grp1() -> TopicName {
    TopicName::new("grp1")
}

fn ctrl(msg: &ClientMessage, code: u16, seq: Option<Seq>) -> ServerMessage {
    ServerMessage::Ctrl(Ctrl {
        id: msg.id().map(str::to_owned),
        topic: Some(msg.topic().clone()),
        code,
        text: if code < 300 { "ok".into() } else { "failed".into() },
        ts: 1_700_000_000_000,
        params: CtrlParams { seq, url: None },
    })
}

/// A server that accepts every request and numbers publishes from
/// `first_seq`. With `echo` it also pushes each published message back to
/// the sender before confirming it, as a real topic does.
fn chat_server(
    first_seq: u64,
    echo: bool,
) -> impl FnMut(&ClientMessage) -> Vec<ServerMessage> + Send {
    let mut next_seq = first_seq;
    move |msg| match msg {
        ClientMessage::Pub(publish) => {
            let seq = Seq::new(next_seq);
            next_seq += 1;
            let mut frames = Vec::new();
            if echo {
                frames.push(ServerMessage::Data(DataEvent {
                    topic: publish.topic.clone(),
                    seq,
                    from: UserId::new("me"),
                    content: publish.content.clone(),
                    ts: 1_700_000_000_000,
                }));
            }
            frames.push(ctrl(msg, 200, Some(seq)));
            frames
        }
        ClientMessage::Note(_) => vec![],
        _ => vec![ctrl(msg, 200, None)],
    }
}

async fn start(transport: MockTransport) -> ChatClient<MockTransport> {
    ChatClient::start(Arc::new(MemoryStore::new()), transport, ClientConfig::default())
        .await
        .unwrap()
}

async fn get(client: &ChatClient<MockTransport>, id: tidings_sync_types::DbId) -> Message {
    client
        .session()
        .store()
        .msg_get(&grp1(), id)
        .await
        .unwrap()
        .unwrap()
}

fn published(transport: &MockTransport) -> Vec<String> {
    transport
        .sent_client_messages()
        .into_iter()
        .filter_map(|m| match m {
            ClientMessage::Pub(p) => p.content.as_text().map(str::to_owned),
            _ => None,
        })
        .collect()
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// ===========================================
// Watermarks
// ===========================================

/// Read watermark 5, info read 9: refresh [6,9]. The duplicate changes nothing.
#[tokio::test]
async fn read_receipt_refreshes_gap_once() {
    let client = start(MockTransport::new()).await;
    let store = client.session().store();
    store.set_read(&grp1(), Seq::new(5)).await.unwrap();
    let mut events = client.events();

    let event = InfoEvent {
        topic: grp1(),
        from: UserId::new("usrBob"),
        what: InfoWhat::Read,
        seq: Some(Seq::new(9)),
    };

    let first = client.session().reconciler().on_info(&event).await.unwrap();
    assert_eq!(first, Refresh::Range(SeqRange::new(Seq::new(6), Seq::new(9))));
    assert_eq!(store.topic_get(&grp1()).await.unwrap().unwrap().read, Some(Seq::new(9)));
    assert_eq!(
        drain(&mut events),
        vec![ClientEvent::Refresh {
            topic: grp1(),
            range: SeqRange::new(Seq::new(6), Seq::new(9)),
        }]
    );

    let second = client.session().reconciler().on_info(&event).await.unwrap();
    assert_eq!(second, Refresh::None);
    assert_eq!(store.topic_get(&grp1()).await.unwrap().unwrap().read, Some(Seq::new(9)));
    assert!(drain(&mut events).is_empty());
}

/// Out-of-order and duplicate receipts never move a watermark backwards.
#[tokio::test]
async fn watermarks_never_decrease() {
    let client = start(MockTransport::new()).await;
    let store = client.session().store();
    let mut highest = 0;

    for seq in [3, 7, 5, 7, 2, 9, 9, 1] {
        let frame = ServerMessage::Info(InfoEvent {
            topic: grp1(),
            from: UserId::new("usrBob"),
            what: InfoWhat::Recv,
            seq: Some(Seq::new(seq)),
        });
        client.handle_frame(&frame.to_bytes().unwrap()).await.unwrap();

        highest = highest.max(seq);
        let topic = store.topic_get(&grp1()).await.unwrap().unwrap();
        assert_eq!(topic.recv, Some(Seq::new(highest)));
        assert_eq!(topic.read, None);
    }
}

/// Peers had received up to 2. Our own receive note for seq 4 does not
/// swallow a peer's later receipt for the same seq.
#[tokio::test]
async fn peer_receipt_after_own_receipt_refreshes() {
    let transport = MockTransport::connected();
    transport.set_responder(chat_server(1, false));
    let client = start(transport.clone()).await;
    let store = client.session().store();
    store.set_recv(&grp1(), Seq::new(2)).await.unwrap();
    let data = ServerMessage::Data(DataEvent {
        topic: grp1(),
        seq: Seq::new(4),
        from: UserId::new("usrBob"),
        content: Content::text("hi"),
        ts: 1_700_000_000_000,
    });
    client.handle_frame(&data.to_bytes().unwrap()).await.unwrap();
    let mut events = client.events();

    let receipt = ServerMessage::Info(InfoEvent {
        topic: grp1(),
        from: UserId::new("usrCarol"),
        what: InfoWhat::Recv,
        seq: Some(Seq::new(4)),
    });
    client.handle_frame(&receipt.to_bytes().unwrap()).await.unwrap();

    assert_eq!(
        drain(&mut events),
        vec![ClientEvent::Refresh {
            topic: grp1(),
            range: SeqRange::new(Seq::new(3), Seq::new(4)),
        }]
    );
    assert_eq!(store.topic_get(&grp1()).await.unwrap().unwrap().recv, Some(Seq::new(4)));
}

// ===========================================
// Lifecycle and flush
// ===========================================

/// "hello" fails with NotConnected, stays Ready, and syncs as 42 on retry.
#[tokio::test]
async fn offline_send_is_retried_after_reconnect() {
    let transport = MockTransport::new();
    let client = start(transport.clone()).await;
    let lifecycle = client.session().lifecycle();

    let id = lifecycle.create_draft(&grp1(), &Content::text("hello")).await.unwrap();
    lifecycle.mark_ready(&grp1(), id, None).await.unwrap();

    let err = lifecycle.sync_one(&grp1(), id).await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
    let msg = get(&client, id).await;
    assert_eq!(msg.state, MessageState::Ready);
    assert_eq!(msg.seq, None);
    assert_eq!(msg.content.as_text(), Some("hello"));

    client.connect("chat.example.com").await.unwrap();
    transport.set_responder(chat_server(42, false));

    let seq = lifecycle.sync_one(&grp1(), id).await.unwrap();
    assert_eq!(seq, Seq::new(42));
    let msg = get(&client, id).await;
    assert_eq!(msg.state, MessageState::Synced);
    assert_eq!(msg.seq, Some(Seq::new(42)));
    assert_eq!(msg.ts, 1_700_000_000_000);
}

/// Messages written offline go out once each, in the order they were written.
#[tokio::test]
async fn offline_queue_flushes_in_order_on_attach() {
    let transport = MockTransport::new();
    let client = start(transport.clone()).await;
    let texts = ["one", "two", "three", "four", "five"];
    let mut ids = Vec::new();
    for text in texts {
        ids.push(client.send(&grp1(), Content::text(text)).await.unwrap());
    }
    assert!(transport.sent_messages().is_empty());

    client.connect("chat.example.com").await.unwrap();
    transport.set_responder(chat_server(10, false));
    client.attach(&grp1()).await.unwrap();

    assert_eq!(published(&transport), texts);
    for (offset, id) in ids.iter().enumerate() {
        let msg = get(&client, *id).await;
        assert_eq!(msg.state, MessageState::Synced);
        assert_eq!(msg.seq, Some(Seq::new(10 + offset as u64)));
    }
}

/// A server failing every publish sees each queued message exactly once.
#[tokio::test]
async fn failing_flush_tries_each_message_once() {
    let transport = MockTransport::new();
    let client = start(transport.clone()).await;
    for text in ["a", "b", "c"] {
        client.send(&grp1(), Content::text(text)).await.unwrap();
    }

    client.connect("chat.example.com").await.unwrap();
    transport.set_responder(|msg| match msg {
        ClientMessage::Pub(_) => vec![ctrl(msg, 503, None)],
        _ => vec![ctrl(msg, 200, None)],
    });
    client.attach(&grp1()).await.unwrap();

    assert_eq!(published(&transport), ["a", "b", "c"]);
    let queued = client.session().store().queued_messages(&grp1()).await.unwrap();
    assert_eq!(queued.len(), 3);
    assert!(queued.iter().all(|m| m.state == MessageState::Ready));
}

/// The server's echo of our own message is folded into the local row.
#[tokio::test]
async fn echo_does_not_duplicate() {
    let transport = MockTransport::connected();
    transport.set_responder(chat_server(7, true));
    let client = start(transport.clone()).await;
    client.attach(&grp1()).await.unwrap();

    let id = client.send(&grp1(), Content::text("echoed")).await.unwrap();

    let visible = client.load_visible(&grp1()).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, id);
    assert_eq!(visible[0].seq, Some(Seq::new(7)));
}

/// A message in flight when the process died is queued again at startup.
#[tokio::test]
async fn in_flight_message_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tidings.db");

    let id = {
        let store = Arc::new(SqliteStore::new(&path).await.unwrap());
        let client = ChatClient::start(store, MockTransport::new(), ClientConfig::default())
            .await
            .unwrap();
        let lifecycle = client.session().lifecycle();
        let id = lifecycle.create_ready(&grp1(), &Content::text("stuck")).await.unwrap();
        lifecycle.begin_sync(&grp1(), id).await.unwrap();
        id
    };

    let store = Arc::new(SqliteStore::new(&path).await.unwrap());
    let transport = MockTransport::connected();
    transport.set_responder(chat_server(1, false));
    let client = ChatClient::start(store, transport.clone(), ClientConfig::default())
        .await
        .unwrap();

    let msg = client.session().store().msg_get(&grp1(), id).await.unwrap().unwrap();
    assert_eq!(msg.state, MessageState::Ready);

    client.attach(&grp1()).await.unwrap();
    assert_eq!(published(&transport), ["stuck"]);
    let msg = client.session().store().msg_get(&grp1(), id).await.unwrap().unwrap();
    assert_eq!(msg.state, MessageState::Synced);
}

// ===========================================
// Attach
// ===========================================

/// Attaching without a connection asks for a reconnect and changes nothing else.
#[tokio::test]
async fn attach_offline_requests_reconnect() {
    let transport = MockTransport::new();
    let client = start(transport.clone()).await;
    let id = client.send(&grp1(), Content::text("waiting")).await.unwrap();
    let mut events = client.events();

    let err = client.attach(&grp1()).await.unwrap_err();

    assert!(matches!(err, ClientError::NotConnected));
    assert_eq!(transport.reconnect_requests(), 1);
    assert!(!client.is_attached(&grp1()));
    assert_eq!(get(&client, id).await.state, MessageState::Ready);
    assert!(matches!(
        drain(&mut events).as_slice(),
        [ClientEvent::AttachFailed { .. }]
    ));

    client.connect("chat.example.com").await.unwrap();
    transport.set_responder(chat_server(1, false));
    client.attach(&grp1()).await.unwrap();
    assert_eq!(get(&client, id).await.state, MessageState::Synced);
}

/// A send that finds the connection gone detaches the topic, so the next
/// attach subscribes again and delivers the queued message.
#[tokio::test]
async fn dropped_connection_detaches_and_reattach_flushes() {
    let transport = MockTransport::connected();
    transport.set_responder(chat_server(20, false));
    let client = start(transport.clone()).await;
    client.attach(&grp1()).await.unwrap();
    let mut events = client.events();

    transport.drop_connection();
    let err = client.send(&grp1(), Content::text("lost")).await.unwrap_err();

    assert!(matches!(err, ClientError::NotConnected));
    assert!(!client.is_attached(&grp1()));
    assert!(!client.session().store().topic_get(&grp1()).await.unwrap().unwrap().attached);
    let queued = client.session().store().queued_messages(&grp1()).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].state, MessageState::Ready);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, ClientEvent::Detached { topic } if *topic == grp1())));

    client.connect("chat.example.com").await.unwrap();
    transport.set_responder(chat_server(20, false));
    client.attach(&grp1()).await.unwrap();

    let subs = transport
        .sent_client_messages()
        .iter()
        .filter(|m| matches!(m, ClientMessage::Sub(_)))
        .count();
    assert_eq!(subs, 2);
    assert_eq!(published(&transport), ["lost"]);
    let msg = get(&client, queued[0].id).await;
    assert_eq!(msg.state, MessageState::Synced);
    assert_eq!(msg.seq, Some(Seq::new(20)));
}

/// A subscribe whose attached flag cannot be stored leaves the topic
/// detached, and the queue goes out on the next attach.
#[tokio::test]
async fn failed_attach_flag_write_does_not_strand_queue() {
    let store = MemoryStore::new();
    let transport = MockTransport::connected();
    transport.set_responder(chat_server(3, false));
    let client = ChatClient::start(
        Arc::new(store.clone()),
        transport.clone(),
        ClientConfig::default(),
    )
    .await
    .unwrap();
    let id = client.send(&grp1(), Content::text("stranded?")).await.unwrap();

    store.set_fail_writes(true);
    let err = client.attach(&grp1()).await.unwrap_err();
    store.set_fail_writes(false);

    assert!(matches!(err, ClientError::StoreWriteFailed(_)));
    assert!(!client.is_attached(&grp1()));
    assert!(published(&transport).is_empty());

    client.attach(&grp1()).await.unwrap();

    assert!(client.is_attached(&grp1()));
    assert_eq!(published(&transport), ["stranded?"]);
    let msg = get(&client, id).await;
    assert_eq!(msg.state, MessageState::Synced);
    assert_eq!(msg.seq, Some(Seq::new(3)));
}

// ===========================================
// History paging
// ===========================================

/// Serves history below `before`, newest first, and always repeats the
/// oldest cached message to test that merging never duplicates a seq.
fn history_server(lowest: u64) -> impl FnMut(&ClientMessage) -> Vec<ServerMessage> + Send {
    move |msg| {
        let get = match msg {
            ClientMessage::Get(get) => get,
            ClientMessage::Note(_) => return vec![],
            _ => return vec![ctrl(msg, 200, None)],
        };
        let data = get.query.data.clone().unwrap_or_default();
        let before = data.before.map(|s| s.value()).unwrap_or(u64::MAX);
        let limit = data.limit.unwrap_or(u32::MAX) as usize;
        let data = |seq: u64| {
            ServerMessage::Data(DataEvent {
                topic: get.topic.clone(),
                seq: Seq::new(seq),
                from: UserId::new("usrBob"),
                content: Content::text("history"),
                ts: seq,
            })
        };
        let mut frames = vec![data(before)];
        frames.extend((lowest..before).rev().take(limit).map(data));
        frames.push(ctrl(msg, 200, None));
        frames
    }
}

#[tokio::test]
async fn older_pages_from_cache_then_server() {
    let transport = MockTransport::connected();
    transport.set_responder(history_server(1));
    let config = ClientConfig::default().with_page_size(4);
    let client = ChatClient::start(Arc::new(MemoryStore::new()), transport.clone(), config)
        .await
        .unwrap();
    let store = client.session().store();
    for seq in 21..=28 {
        store
            .msg_received(&grp1(), Seq::new(seq), &UserId::new("usrBob"), &Content::text("x"), seq)
            .await
            .unwrap();
    }
    let requests = |t: &MockTransport| {
        t.sent_client_messages()
            .iter()
            .filter(|m| matches!(m, ClientMessage::Get(_)))
            .count()
    };

    assert_eq!(client.open(&grp1()).await.unwrap().len(), 4);

    // Cache holds 8, window is 4: no request.
    let visible = client.load_older(&grp1()).await.unwrap();
    assert_eq!(visible.len(), 8);
    assert_eq!(requests(&transport), 0);

    // Cache exhausted: exactly one request.
    let visible = client.load_older(&grp1()).await.unwrap();
    assert_eq!(requests(&transport), 1);
    assert_eq!(visible.len(), 12);

    let mut seqs: Vec<u64> = visible.iter().filter_map(|m| m.seq).map(|s| s.value()).collect();
    assert_eq!(seqs.first(), Some(&28));
    assert_eq!(seqs.last(), Some(&17));
    let total = seqs.len();
    seqs.dedup();
    assert_eq!(seqs.len(), total);
    assert_eq!(store.msg_count(&grp1()).await.unwrap(), 12);
}

// ===========================================
// Failures
// ===========================================

/// A failed store write is reported and nothing is queued.
#[tokio::test]
async fn store_failure_is_surfaced() {
    let store = MemoryStore::new();
    let client = ChatClient::start(
        Arc::new(store.clone()),
        MockTransport::new(),
        ClientConfig::default(),
    )
    .await
    .unwrap();

    store.set_fail_writes(true);
    let err = client.send(&grp1(), Content::text("lost?")).await.unwrap_err();
    store.set_fail_writes(false);

    assert!(matches!(err, ClientError::StoreWriteFailed(_)));
    assert!(store.queued_messages(&grp1()).await.unwrap().is_empty());
}

/// Deleting a message the server never saw sends nothing.
#[tokio::test]
async fn deleting_unsent_message_is_local() {
    let transport = MockTransport::connected();
    transport.set_responder(chat_server(1, false));
    let client = start(transport.clone()).await;
    client.attach(&grp1()).await.unwrap();
    let sent_before = transport.sent_messages().len();

    let id = client.save_draft(&grp1(), Content::text("scratch")).await.unwrap();
    client.delete_message(&grp1(), id, true).await.unwrap();

    assert_eq!(transport.sent_messages().len(), sent_before);
    assert!(client.session().store().msg_get(&grp1(), id).await.unwrap().is_none());
}
