//! End-to-end scenarios: a real session driven over the in-memory
//! transport with a paused clock.

use std::sync::Arc;
use std::time::Duration;

use academy_chat::config::ChatConfig;
use academy_chat::connection::Status;
use academy_chat::events::{MessageUpdate, ReceiptUpdate, TypingUpdate};
use academy_chat::models::{ConversationMeta, Delivery, LocalUser};
use academy_chat::protocol::{ClientEvent, ServerEvent};
use academy_chat::session::{ChatSession, SessionProfile};
use academy_chat::testing::{MemoryTransport, ServerPeer, StaticApi};

fn test_config() -> ChatConfig {
    let mut cfg = ChatConfig::default();
    cfg.reconnect.max_attempts = 5;
    cfg.reconnect.base_delay_ms = 100;
    cfg.reconnect.max_delay_ms = 1_000;
    cfg.reconnect.handshake_timeout_ms = 1_000;
    cfg.typing.quiet_interval_ms = 2_000;
    cfg.typing.remote_expiry_ms = 6_000;
    cfg.delivery.ack_timeout_ms = 5_000;
    cfg.delivery.read_flush_ms = 250;
    cfg
}

fn local_user() -> LocalUser {
    LocalUser {
        user_id: "u-me".to_string(),
        display_name: "Me".to_string(),
    }
}

fn meta(conversation_id: &str, name: Option<&str>) -> ConversationMeta {
    ConversationMeta {
        conversation_id: conversation_id.to_string(),
        counterpart_name: name.map(str::to_string),
        last_message_at: None,
        unread_count: 0,
    }
}

fn staff_message(conversation_id: &str, id: &str, at: &str, body: &str) -> ServerEvent {
    ServerEvent::NewMessage {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: "u-staff".to_string(),
        sender_name: "Support".to_string(),
        body: body.to_string(),
        created_at: at.parse().unwrap(),
        client_ref: None,
    }
}

async fn login_widget(
    api: Arc<StaticApi>,
) -> (
    ChatSession,
    ServerPeer,
    tokio::sync::mpsc::Receiver<ServerPeer>,
) {
    let (transport, mut peers) = MemoryTransport::accepting("u-me");
    let session = ChatSession::login(
        test_config(),
        local_user(),
        "credential".to_string(),
        api,
        transport,
        SessionProfile::Widget,
    )
    .await
    .expect("login");

    let mut state = session.connection_state();
    state
        .wait_for(|s| s.status == Status::Connected)
        .await
        .expect("connected");
    let peer = peers.recv().await.expect("first connection");
    (session, peer, peers)
}

async fn login_console(
    api: Arc<StaticApi>,
) -> (
    ChatSession,
    ServerPeer,
    tokio::sync::mpsc::Receiver<ServerPeer>,
) {
    let (transport, mut peers) = MemoryTransport::accepting("u-admin");
    let session = ChatSession::login(
        test_config(),
        LocalUser {
            user_id: "u-admin".to_string(),
            display_name: "Admin".to_string(),
        },
        "credential".to_string(),
        api,
        transport,
        SessionProfile::Console,
    )
    .await
    .expect("login");

    let mut state = session.connection_state();
    state
        .wait_for(|s| s.status == Status::Connected)
        .await
        .expect("connected");
    let peer = peers.recv().await.expect("first connection");
    (session, peer, peers)
}

/// Let the paused clock run past every armed timer and the pump settle.
async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn optimistic_send_is_reconciled_to_the_server_message() {
    let api = Arc::new(StaticApi::new());
    api.set_own_conversation(meta("conv-main", Some("Support")));
    let (session, mut peer, _peers) = login_widget(api).await;
    let mut messages = session.messages();

    let temp_id = session.send_message("conv-main", "hello").await.expect("send");
    assert!(temp_id.starts_with("tmp-"));

    // The optimistic entry is visible immediately, pending.
    match messages.recv().await.unwrap() {
        MessageUpdate::Appended { message, .. } => {
            assert_eq!(message.id, temp_id);
            assert_eq!(message.delivery, Delivery::Pending);
        }
        other => panic!("unexpected update: {:?}", other),
    }

    // The wire carried the conversation id and the correlation ref.
    let client_ref = match peer.from_client.recv().await.unwrap() {
        ClientEvent::SendMessage {
            conversation_id,
            body,
            client_ref,
        } => {
            assert_eq!(conversation_id, "conv-main");
            assert_eq!(body, "hello");
            client_ref
        }
        other => panic!("unexpected client event: {:?}", other),
    };

    // Acknowledge under a server id.
    peer.to_client
        .send(ServerEvent::NewMessage {
            id: "m-100".to_string(),
            conversation_id: "conv-main".to_string(),
            sender_id: "u-me".to_string(),
            sender_name: "Me".to_string(),
            body: "hello".to_string(),
            created_at: "2025-03-01T12:00:00Z".parse().unwrap(),
            client_ref: Some(client_ref),
        })
        .await
        .unwrap();

    match messages.recv().await.unwrap() {
        MessageUpdate::Reconciled {
            temp_id: reconciled,
            message,
            ..
        } => {
            assert_eq!(reconciled, temp_id);
            assert_eq!(message.id, "m-100");
        }
        other => panic!("unexpected update: {:?}", other),
    }

    // Exactly one visible entry for "hello", under the server id.
    let snapshot = session.snapshot("conv-main").await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, "m-100");
    assert_eq!(snapshot[0].body, "hello");
    assert_eq!(snapshot[0].delivery, Delivery::Confirmed);
}

#[tokio::test(start_paused = true)]
async fn disconnect_mid_send_leaves_a_failed_entry_until_manual_resend() {
    let api = Arc::new(StaticApi::new());
    api.set_own_conversation(meta("conv-main", Some("Support")));
    let (session, mut peer, mut peers) = login_widget(api).await;
    let mut messages = session.messages();

    let temp_id = session.send_message("conv-main", "lost?").await.expect("send");
    match messages.recv().await.unwrap() {
        MessageUpdate::Appended { .. } => {}
        other => panic!("unexpected update: {:?}", other),
    }
    // The send reached the wire but is never acknowledged.
    assert!(matches!(
        peer.from_client.recv().await.unwrap(),
        ClientEvent::SendMessage { .. }
    ));

    // Forcible disconnect: the pending send must fail, not vanish.
    drop(peer);
    match messages.recv().await.unwrap() {
        MessageUpdate::SendFailed {
            temp_id: failed, ..
        } => assert_eq!(failed, temp_id),
        other => panic!("unexpected update: {:?}", other),
    }

    // The session reconnects on its own; the entry is still failed.
    let mut state = session.connection_state();
    state
        .wait_for(|s| s.status == Status::Connected)
        .await
        .expect("reconnected");
    let mut second_peer = peers.recv().await.expect("second connection");

    let snapshot = session.snapshot("conv-main").await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].delivery, Delivery::Failed);

    // Explicit resend re-arms it and it reconciles as usual.
    session.resend("conv-main", &temp_id).await.expect("resend");
    let client_ref = match second_peer.from_client.recv().await.unwrap() {
        ClientEvent::SendMessage { client_ref, .. } => client_ref,
        other => panic!("unexpected client event: {:?}", other),
    };
    second_peer
        .to_client
        .send(ServerEvent::NewMessage {
            id: "m-200".to_string(),
            conversation_id: "conv-main".to_string(),
            sender_id: "u-me".to_string(),
            sender_name: "Me".to_string(),
            body: "lost?".to_string(),
            created_at: "2025-03-01T12:01:00Z".parse().unwrap(),
            client_ref: Some(client_ref),
        })
        .await
        .unwrap();

    loop {
        match messages.recv().await.unwrap() {
            MessageUpdate::Reconciled { message, .. } => {
                assert_eq!(message.id, "m-200");
                break;
            }
            MessageUpdate::Resent { .. } => continue,
            other => panic!("unexpected update: {:?}", other),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn ack_timeout_fails_the_send_without_retrying() {
    let api = Arc::new(StaticApi::new());
    api.set_own_conversation(meta("conv-main", Some("Support")));
    let (session, mut peer, _peers) = login_widget(api).await;
    let mut messages = session.messages();

    let temp_id = session.send_message("conv-main", "anyone?").await.expect("send");
    match messages.recv().await.unwrap() {
        MessageUpdate::Appended { .. } => {}
        other => panic!("unexpected update: {:?}", other),
    }
    assert!(matches!(
        peer.from_client.recv().await.unwrap(),
        ClientEvent::SendMessage { .. }
    ));

    // No acknowledgment ever arrives; the bounded window elapses.
    match messages.recv().await.unwrap() {
        MessageUpdate::SendFailed {
            temp_id: failed, ..
        } => assert_eq!(failed, temp_id),
        other => panic!("unexpected update: {:?}", other),
    }

    // Failed, visible, and nothing was resent on the wire.
    let snapshot = session.snapshot("conv-main").await.unwrap();
    assert_eq!(snapshot[0].delivery, Delivery::Failed);
    settle(500).await;
    assert!(peer.from_client.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn out_of_order_and_duplicate_delivery_settle_into_one_ordered_log() {
    let api = Arc::new(StaticApi::new());
    api.set_own_conversation(meta("conv-main", Some("Support")));
    let (session, peer, _peers) = login_widget(api).await;
    let mut messages = session.messages();

    // Delivered out of causal order, with a duplicate in the middle.
    peer.to_client
        .send(staff_message("conv-main", "m-2", "2025-03-01T12:00:02Z", "second"))
        .await
        .unwrap();
    peer.to_client
        .send(staff_message("conv-main", "m-1", "2025-03-01T12:00:01Z", "first"))
        .await
        .unwrap();
    peer.to_client
        .send(staff_message("conv-main", "m-2", "2025-03-01T12:00:02Z", "second"))
        .await
        .unwrap();
    peer.to_client
        .send(staff_message("conv-main", "m-3", "2025-03-01T12:00:03Z", "third"))
        .await
        .unwrap();

    // Three appends; the redelivery is silent.
    for _ in 0..3 {
        assert!(matches!(
            messages.recv().await.unwrap(),
            MessageUpdate::Appended { .. }
        ));
    }

    let snapshot = session.snapshot("conv-main").await.unwrap();
    let ids: Vec<&str> = snapshot.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);
    assert_eq!(
        snapshot.iter().filter(|m| m.body == "second").count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn focusing_an_unread_conversation_emits_one_read_receipt() {
    let api = Arc::new(StaticApi::new());
    api.set_own_conversation(meta("conv-main", Some("Support")));
    let (session, mut peer, _peers) = login_widget(api).await;
    let mut receipts = session.receipts();

    peer.to_client
        .send(staff_message("conv-main", "m-1", "2025-03-01T12:00:01Z", "hi"))
        .await
        .unwrap();
    peer.to_client
        .send(staff_message("conv-main", "m-2", "2025-03-01T12:00:02Z", "there"))
        .await
        .unwrap();

    // Unread while unfocused.
    loop {
        match receipts.recv().await.unwrap() {
            ReceiptUpdate::UnreadChanged { unread, .. } if unread == 2 => break,
            ReceiptUpdate::UnreadChanged { .. } => continue,
            other => panic!("unexpected receipt: {:?}", other),
        }
    }

    // Focus: one coalesced mark_as_read after the flush window, and the
    // counter drops to zero.
    session.focus("conv-main").await;
    match peer.from_client.recv().await.unwrap() {
        ClientEvent::MarkAsRead { conversation_id } => {
            assert_eq!(conversation_id, "conv-main");
        }
        other => panic!("unexpected client event: {:?}", other),
    }
    loop {
        match receipts.recv().await.unwrap() {
            ReceiptUpdate::UnreadChanged { unread, .. } => {
                assert_eq!(unread, 0);
                break;
            }
            other => panic!("unexpected receipt: {:?}", other),
        }
    }

    // Refocusing with no new messages must not re-emit the boundary.
    session.unfocus("conv-main").await;
    session.focus("conv-main").await;
    settle(1_000).await;
    assert!(peer.from_client.try_recv().is_err());

    // A new arrival while focused coalesces into one fresh receipt.
    peer.to_client
        .send(staff_message("conv-main", "m-3", "2025-03-01T12:00:03Z", "more"))
        .await
        .unwrap();
    match peer.from_client.recv().await.unwrap() {
        ClientEvent::MarkAsRead { .. } => {}
        other => panic!("unexpected client event: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn unfocusing_cancels_the_pending_read_flush() {
    let api = Arc::new(StaticApi::new());
    api.set_own_conversation(meta("conv-main", Some("Support")));
    let (session, mut peer, _peers) = login_widget(api).await;

    peer.to_client
        .send(staff_message("conv-main", "m-1", "2025-03-01T12:00:01Z", "hi"))
        .await
        .unwrap();
    settle(10).await;

    // Focus then unfocus inside the flush window: nothing is emitted and
    // the message stays unread.
    session.focus("conv-main").await;
    session.unfocus("conv-main").await;
    settle(1_000).await;
    assert!(peer.from_client.try_recv().is_err());

    let snapshot = session.snapshot("conv-main").await.unwrap();
    assert!(!snapshot[0].read);
}

#[tokio::test(start_paused = true)]
async fn keystrokes_debounce_into_one_start_and_one_stop() {
    let api = Arc::new(StaticApi::new());
    api.set_own_conversation(meta("conv-main", Some("Support")));
    let (session, mut peer, _peers) = login_widget(api).await;

    session.keystroke("conv-main").await;
    match peer.from_client.recv().await.unwrap() {
        ClientEvent::Typing { is_typing, .. } => assert!(is_typing),
        other => panic!("unexpected client event: {:?}", other),
    }

    // More keystrokes inside the quiet window: no further signals.
    settle(500).await;
    session.keystroke("conv-main").await;
    settle(400).await;
    session.keystroke("conv-main").await;

    // Silence: exactly one stop when the quiet interval elapses.
    match peer.from_client.recv().await.unwrap() {
        ClientEvent::Typing { is_typing, .. } => assert!(!is_typing),
        other => panic!("unexpected client event: {:?}", other),
    }
    settle(3_000).await;
    assert!(peer.from_client.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn sending_flushes_an_immediate_typing_stop() {
    let api = Arc::new(StaticApi::new());
    api.set_own_conversation(meta("conv-main", Some("Support")));
    let (session, mut peer, _peers) = login_widget(api).await;

    session.keystroke("conv-main").await;
    assert!(matches!(
        peer.from_client.recv().await.unwrap(),
        ClientEvent::Typing { is_typing: true, .. }
    ));

    session.send_message("conv-main", "done").await.expect("send");
    // Stop precedes the message on the wire.
    assert!(matches!(
        peer.from_client.recv().await.unwrap(),
        ClientEvent::Typing { is_typing: false, .. }
    ));
    assert!(matches!(
        peer.from_client.recv().await.unwrap(),
        ClientEvent::SendMessage { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn stale_remote_typing_indicator_expires_without_a_stop_event() {
    let api = Arc::new(StaticApi::new());
    api.set_own_conversation(meta("conv-main", Some("Support")));
    let (session, peer, _peers) = login_widget(api).await;
    let mut typing = session.typing();

    peer.to_client
        .send(ServerEvent::UserTyping {
            conversation_id: "conv-main".to_string(),
            user_id: "u-staff".to_string(),
            is_typing: true,
        })
        .await
        .unwrap();
    assert!(matches!(
        typing.recv().await.unwrap(),
        TypingUpdate::Started { .. }
    ));

    // The remote stop event is lost; the indicator must still clear.
    assert!(matches!(
        typing.recv().await.unwrap(),
        TypingUpdate::Stopped { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn unknown_conversation_creates_placeholder_then_backfills_metadata() {
    let api = Arc::new(StaticApi::new());
    api.add_conversation(meta("conv-a", Some("Alice")));
    // Metadata for the not-yet-known conversation is resolvable over REST
    // without it appearing in the bootstrap list.
    api.set_metadata(meta("conv-new", Some("Newcomer")));
    let (session, peer, _peers) = login_console(api).await;
    let mut list = session.conversation_list();

    peer.to_client
        .send(staff_message("conv-new", "m-2", "2025-03-01T12:00:02Z", "newer"))
        .await
        .unwrap();
    peer.to_client
        .send(staff_message("conv-new", "m-1", "2025-03-01T12:00:01Z", "older"))
        .await
        .unwrap();

    // The messages are visible and ordered before metadata resolves.
    loop {
        let snapshot = session.snapshot("conv-new").await.unwrap_or_default();
        if snapshot.len() == 2 {
            let ids: Vec<&str> = snapshot.iter().map(|m| m.id.as_str()).collect();
            assert_eq!(ids, vec!["m-1", "m-2"]);
            break;
        }
        settle(5).await;
    }

    // The display name arrives later, without disturbing the order.
    loop {
        let summaries = list.recv().await.unwrap();
        let row = summaries
            .iter()
            .find(|s| s.conversation_id == "conv-new");
        if let Some(row) = row {
            if row.counterpart_name.as_deref() == Some("Newcomer") {
                break;
            }
        }
    }
    let snapshot = session.snapshot("conv-new").await.unwrap();
    let ids: Vec<&str> = snapshot.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m-1", "m-2"]);
}

#[tokio::test(start_paused = true)]
async fn console_list_reorders_on_activity_across_conversations() {
    let api = Arc::new(StaticApi::new());
    api.add_conversation(meta("conv-a", Some("Alice")));
    api.add_conversation(meta("conv-b", Some("Bob")));
    let (session, peer, _peers) = login_console(api).await;

    peer.to_client
        .send(staff_message("conv-a", "m-1", "2025-03-01T12:00:01Z", "from alice"))
        .await
        .unwrap();
    peer.to_client
        .send(staff_message("conv-b", "m-2", "2025-03-01T12:00:02Z", "from bob"))
        .await
        .unwrap();
    settle(10).await;

    let list = session.conversations().await;
    let order: Vec<&str> = list.iter().map(|s| s.conversation_id.as_str()).collect();
    assert_eq!(order, vec!["conv-b", "conv-a"]);
    assert_eq!(list[0].preview.as_deref(), Some("from bob"));
    assert_eq!(list[0].unread, 1);

    // Newer activity in conv-a flips the order.
    peer.to_client
        .send(staff_message("conv-a", "m-3", "2025-03-01T12:00:03Z", "again"))
        .await
        .unwrap();
    settle(10).await;

    let list = session.conversations().await;
    let order: Vec<&str> = list.iter().map(|s| s.conversation_id.as_str()).collect();
    assert_eq!(order, vec!["conv-a", "conv-b"]);
}

#[tokio::test(start_paused = true)]
async fn counterpart_read_receipt_marks_own_messages_read() {
    let api = Arc::new(StaticApi::new());
    api.set_own_conversation(meta("conv-main", Some("Support")));
    let (session, mut peer, _peers) = login_widget(api).await;
    let mut receipts = session.receipts();

    session.send_message("conv-main", "seen yet?").await.expect("send");
    let client_ref = match peer.from_client.recv().await.unwrap() {
        ClientEvent::SendMessage { client_ref, .. } => client_ref,
        other => panic!("unexpected client event: {:?}", other),
    };
    peer.to_client
        .send(ServerEvent::NewMessage {
            id: "m-1".to_string(),
            conversation_id: "conv-main".to_string(),
            sender_id: "u-me".to_string(),
            sender_name: "Me".to_string(),
            body: "seen yet?".to_string(),
            created_at: "2025-03-01T12:00:00Z".parse().unwrap(),
            client_ref: Some(client_ref),
        })
        .await
        .unwrap();

    peer.to_client
        .send(ServerEvent::MessagesRead {
            conversation_id: "conv-main".to_string(),
        })
        .await
        .unwrap();

    loop {
        match receipts.recv().await.unwrap() {
            ReceiptUpdate::CounterpartRead { conversation_id } => {
                assert_eq!(conversation_id, "conv-main");
                break;
            }
            ReceiptUpdate::UnreadChanged { .. } => continue,
        }
    }
    let snapshot = session.snapshot("conv-main").await.unwrap();
    assert!(snapshot[0].read);
}

#[tokio::test(start_paused = true)]
async fn sends_are_refused_while_disconnected() {
    let api = Arc::new(StaticApi::new());
    api.set_own_conversation(meta("conv-main", Some("Support")));
    let (session, peer, _peers) = login_widget(api).await;

    drop(peer);
    let mut state = session.connection_state();
    state
        .wait_for(|s| s.status != Status::Connected)
        .await
        .expect("disconnected");

    let err = session
        .send_message("conv-main", "into the void")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        academy_chat::ChatError::ConnectionClosed
    ));

    // Nothing optimistic was appended for the refused send.
    let snapshot = session.snapshot("conv-main").await.unwrap();
    assert!(snapshot.is_empty());
}

#[tokio::test(start_paused = true)]
async fn bootstrap_seeds_history_before_realtime_events() {
    let api = Arc::new(StaticApi::new());
    api.set_own_conversation(meta("conv-main", Some("Support")));
    let seeded = academy_chat::models::Message {
        id: "m-old".to_string(),
        conversation_id: "conv-main".to_string(),
        sender_id: "u-staff".to_string(),
        sender_name: "Support".to_string(),
        body: "welcome".to_string(),
        created_at: "2025-03-01T11:00:00Z".parse().unwrap(),
        read: true,
        delivery: Delivery::Confirmed,
    };
    api.set_page("conv-main", vec![seeded]);
    let (session, peer, _peers) = login_widget(api).await;

    // History is present and read; a live event lands after it.
    peer.to_client
        .send(staff_message("conv-main", "m-new", "2025-03-01T12:00:00Z", "live"))
        .await
        .unwrap();
    settle(10).await;

    let snapshot = session.snapshot("conv-main").await.unwrap();
    let ids: Vec<&str> = snapshot.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m-old", "m-new"]);

    let list = session.conversations().await;
    assert_eq!(list[0].unread, 1);
}
