//! Chat Session
//!
//! The explicit service object that replaces ambient shared connection
//! state: created on login, torn down on logout, injected into
//! consumers. It owns the connection manager, the conversation store(s),
//! the typing debouncers and read-receipt trackers, and the single
//! event-pump task that drives all of them.
//!
//! Processing is strictly sequential: the pump multiplexes commands,
//! inbound transport events, connectivity transitions, and timer
//! deadlines through one `select!` loop, so store state never needs a
//! lock. The connection is established once per login and closed once
//! per logout; opening or closing a chat view only drives focus.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::connection::{ConnectionHandle, ConnectionManager, ConnectionState, Status};
use crate::coordinator::{MultiConversationCoordinator, RouteOutcome};
use crate::error::ChatError;
use crate::events::{EventStreams, MessageUpdate, ReceiptUpdate, TypingUpdate};
use crate::models::{ConversationMeta, ConversationSummary, Delivery, LocalUser, Message};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::read_receipts::ReadReceiptTracker;
use crate::rest::ConversationApi;
use crate::store::{ConversationStore, InboundOutcome};
use crate::transport::Transport;
use crate::typing::{RemoteTypingTable, TypingDebouncer, TypingSignal};

/// Which surface this session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProfile {
    /// End-user widget: one implicit conversation, fetched-or-created at
    /// login.
    Widget,
    /// Admin console: all conversations, recency-ordered.
    Console,
}

/// Commands that can be sent to the session actor.
enum SessionCommand {
    SendMessage {
        conversation_id: String,
        body: String,
        respond_to: oneshot::Sender<Result<String, ChatError>>,
    },
    ResendMessage {
        conversation_id: String,
        temp_id: String,
        respond_to: oneshot::Sender<Result<(), ChatError>>,
    },
    Keystroke {
        conversation_id: String,
    },
    SetFocus {
        conversation_id: String,
        focused: bool,
    },
    Snapshot {
        conversation_id: String,
        respond_to: oneshot::Sender<Option<Vec<Message>>>,
    },
    ListConversations {
        respond_to: oneshot::Sender<Vec<ConversationSummary>>,
    },
}

/// Handle to a live session. Dropping it (or calling [`logout`]) cancels
/// the pump, every outstanding timer, and the connection.
///
/// [`logout`]: ChatSession::logout
pub struct ChatSession {
    commands: mpsc::Sender<SessionCommand>,
    streams: EventStreams,
    connection: ConnectionHandle,
    cancel: CancellationToken,
    own_conversation_id: Option<String>,
}

impl ChatSession {
    /// Bootstrap state over REST, establish the realtime connection, and
    /// start the event pump.
    pub async fn login(
        cfg: ChatConfig,
        local: LocalUser,
        credential: String,
        api: Arc<dyn ConversationApi>,
        transport: Arc<dyn Transport>,
        profile: SessionProfile,
    ) -> Result<Self, ChatError> {
        let page_size = cfg.delivery.page_size;
        let mut own_conversation_id = None;

        // REST bootstraps state before realtime events are trusted.
        let conversations = match profile {
            SessionProfile::Widget => {
                let meta = api.fetch_or_create_conversation().await?;
                let page = api
                    .message_page(&meta.conversation_id, None, page_size)
                    .await?;
                let mut store = ConversationStore::new(
                    &meta.conversation_id,
                    &local,
                    meta.counterpart_name.clone(),
                );
                store.seed_history(page);
                match api.unread_count(&meta.conversation_id).await {
                    Ok(server_unread) if server_unread != store.unread_count() => {
                        debug!(
                            "Bootstrap unread mismatch for {}: server {}, recomputed {}",
                            meta.conversation_id,
                            server_unread,
                            store.unread_count()
                        );
                    }
                    Ok(_) => {}
                    Err(err) => debug!("Bootstrap unread fetch failed: {}", err),
                }
                own_conversation_id = Some(meta.conversation_id);
                Conversations::Single(store)
            }
            SessionProfile::Console => {
                let mut coordinator = MultiConversationCoordinator::new(local.clone());
                for meta in api.list_conversations().await? {
                    let page = api
                        .message_page(&meta.conversation_id, None, page_size)
                        .await?;
                    coordinator.seed(meta, page);
                }
                Conversations::Multi(coordinator)
            }
        };

        let connection =
            ConnectionManager::connect(transport, credential, cfg.reconnect.clone());
        let streams = EventStreams::new();
        let cancel = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::channel(64);
        let (metadata_tx, metadata_rx) = mpsc::channel(64);

        info!(
            "Chat session started for {} ({:?})",
            local.user_id, profile
        );

        let remote_typing_table = RemoteTypingTable::new(cfg.typing.remote_expiry());
        let actor = SessionActor {
            cfg,
            local,
            conversations,
            receipts: HashMap::new(),
            debouncers: HashMap::new(),
            remote_typing_table,
            connection: connection.clone(),
            conn_state: connection.state(),
            events: connection.subscribe_events(),
            events_closed: false,
            conn_state_closed: false,
            api,
            streams: streams.clone(),
            commands: command_rx,
            metadata_tx,
            metadata_rx,
            cancel: cancel.clone(),
            was_connected: false,
        };
        tokio::spawn(actor.run());

        Ok(ChatSession {
            commands: command_tx,
            streams,
            connection,
            cancel,
            own_conversation_id,
        })
    }

    /// The widget's own conversation id, if this is a widget session.
    pub fn own_conversation_id(&self) -> Option<&str> {
        self.own_conversation_id.as_deref()
    }

    /// Observable connection state (lifecycle stream).
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state()
    }

    pub fn messages(&self) -> broadcast::Receiver<MessageUpdate> {
        self.streams.subscribe_messages()
    }

    pub fn typing(&self) -> broadcast::Receiver<TypingUpdate> {
        self.streams.subscribe_typing()
    }

    pub fn receipts(&self) -> broadcast::Receiver<ReceiptUpdate> {
        self.streams.subscribe_receipts()
    }

    pub fn conversation_list(&self) -> broadcast::Receiver<Vec<ConversationSummary>> {
        self.streams.subscribe_list()
    }

    /// Optimistically append and send a message. Returns the temporary id
    /// of the pending entry. Refused while disconnected.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        body: &str,
    ) -> Result<String, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::SendMessage {
                conversation_id: conversation_id.to_string(),
                body: body.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| ChatError::ConnectionClosed)?;
        rx.await.map_err(|_| ChatError::ConnectionClosed)?
    }

    /// Explicitly resend a failed entry. Never happens automatically.
    pub async fn resend(&self, conversation_id: &str, temp_id: &str) -> Result<(), ChatError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::ResendMessage {
                conversation_id: conversation_id.to_string(),
                temp_id: temp_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| ChatError::ConnectionClosed)?;
        rx.await.map_err(|_| ChatError::ConnectionClosed)?
    }

    /// Raw keystroke activity; debounced into typing signals.
    pub async fn keystroke(&self, conversation_id: &str) {
        let _ = self
            .commands
            .send(SessionCommand::Keystroke {
                conversation_id: conversation_id.to_string(),
            })
            .await;
    }

    /// The conversation became visible; arms a read flush when unread.
    pub async fn focus(&self, conversation_id: &str) {
        let _ = self
            .commands
            .send(SessionCommand::SetFocus {
                conversation_id: conversation_id.to_string(),
                focused: true,
            })
            .await;
    }

    /// The conversation was hidden; cancels its pending read flush.
    pub async fn unfocus(&self, conversation_id: &str) {
        let _ = self
            .commands
            .send(SessionCommand::SetFocus {
                conversation_id: conversation_id.to_string(),
                focused: false,
            })
            .await;
    }

    /// Committed log snapshot for one conversation.
    pub async fn snapshot(&self, conversation_id: &str) -> Option<Vec<Message>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Snapshot {
                conversation_id: conversation_id.to_string(),
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Current recency-ordered conversation list.
    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::ListConversations { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Tear down: close the connection, cancel every outstanding timer,
    /// and mark in-flight sends failed.
    pub fn logout(&self) {
        self.connection.close();
        self.cancel.cancel();
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.logout();
    }
}

/// The store collection behind a session: a single implicit conversation
/// for the widget, a coordinator for the console.
enum Conversations {
    Single(ConversationStore),
    Multi(MultiConversationCoordinator),
}

impl Conversations {
    fn store(&self, conversation_id: &str) -> Option<&ConversationStore> {
        match self {
            Conversations::Single(store) => {
                (store.conversation_id() == conversation_id).then_some(store)
            }
            Conversations::Multi(coordinator) => coordinator.store(conversation_id),
        }
    }

    fn store_mut(&mut self, conversation_id: &str) -> Option<&mut ConversationStore> {
        match self {
            Conversations::Single(store) => {
                (store.conversation_id() == conversation_id).then_some(store)
            }
            Conversations::Multi(coordinator) => coordinator.store_mut(conversation_id),
        }
    }

    /// Route an inbound message. `None` means the event belongs to a
    /// conversation this session does not follow (widget only).
    fn route_inbound(&mut self, message: Message, client_ref: Option<&str>) -> Option<RouteOutcome> {
        match self {
            Conversations::Single(store) => {
                if store.conversation_id() != message.conversation_id {
                    return None;
                }
                Some(RouteOutcome {
                    outcome: store.apply_inbound(message, client_ref),
                    created_placeholder: false,
                })
            }
            Conversations::Multi(coordinator) => {
                Some(coordinator.route_inbound(message, client_ref))
            }
        }
    }

    fn backfill_metadata(&mut self, conversation_id: &str, name: &str) -> bool {
        match self {
            Conversations::Single(store) => {
                if store.conversation_id() == conversation_id {
                    store.set_counterpart_name(name);
                    true
                } else {
                    false
                }
            }
            Conversations::Multi(coordinator) => {
                coordinator.backfill_metadata(conversation_id, name)
            }
        }
    }

    fn list(&self) -> Vec<ConversationSummary> {
        match self {
            Conversations::Single(store) => vec![store.summary()],
            Conversations::Multi(coordinator) => coordinator.list(),
        }
    }

    fn ack_deadline(&self) -> Option<Instant> {
        match self {
            Conversations::Single(store) => store.ack_deadline(),
            Conversations::Multi(coordinator) => coordinator.ack_deadline(),
        }
    }

    fn expire_acks(&mut self, now: Instant) -> Vec<(String, String)> {
        match self {
            Conversations::Single(store) => {
                let conversation_id = store.conversation_id().to_string();
                store
                    .expire_acks(now)
                    .into_iter()
                    .map(|temp_id| (conversation_id.clone(), temp_id))
                    .collect()
            }
            Conversations::Multi(coordinator) => coordinator.expire_acks(now),
        }
    }

    fn fail_all_pending(&mut self) -> Vec<(String, String)> {
        match self {
            Conversations::Single(store) => {
                let conversation_id = store.conversation_id().to_string();
                store
                    .fail_all_pending()
                    .into_iter()
                    .map(|temp_id| (conversation_id.clone(), temp_id))
                    .collect()
            }
            Conversations::Multi(coordinator) => coordinator.fail_all_pending(),
        }
    }
}

struct SessionActor {
    cfg: ChatConfig,
    local: LocalUser,
    conversations: Conversations,
    receipts: HashMap<String, ReadReceiptTracker>,
    debouncers: HashMap<String, TypingDebouncer>,
    remote_typing_table: RemoteTypingTable,
    connection: ConnectionHandle,
    conn_state: watch::Receiver<ConnectionState>,
    events: broadcast::Receiver<ServerEvent>,
    events_closed: bool,
    conn_state_closed: bool,
    api: Arc<dyn ConversationApi>,
    streams: EventStreams,
    commands: mpsc::Receiver<SessionCommand>,
    metadata_tx: mpsc::Sender<(String, Result<ConversationMeta, ChatError>)>,
    metadata_rx: mpsc::Receiver<(String, Result<ConversationMeta, ChatError>)>,
    cancel: CancellationToken,
    was_connected: bool,
}

impl SessionActor {
    async fn run(mut self) {
        self.publish_list();
        loop {
            let deadline = self.next_deadline();
            let timer = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = self.events.recv(), if !self.events_closed => match event {
                    Ok(event) => self.handle_server_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Inbound event stream lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => self.events_closed = true,
                },
                result = self.conn_state.changed(), if !self.conn_state_closed => {
                    match result {
                        Ok(()) => self.handle_connectivity(),
                        Err(_) => self.conn_state_closed = true,
                    }
                }
                Some((conversation_id, result)) = self.metadata_rx.recv() => {
                    self.handle_metadata(conversation_id, result);
                }
                _ = timer => self.handle_deadlines().await,
            }
        }

        // Teardown: nothing may be left indefinitely pending.
        for (conversation_id, temp_id) in self.conversations.fail_all_pending() {
            self.streams.publish_message(MessageUpdate::SendFailed {
                conversation_id,
                temp_id,
            });
        }
        debug!("Session pump stopped");
    }

    // =========================================================================
    // Inbound events
    // =========================================================================

    fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage {
                id,
                conversation_id,
                sender_id,
                sender_name,
                body,
                created_at,
                client_ref,
            } => {
                let message = Message {
                    id,
                    conversation_id: conversation_id.clone(),
                    sender_id: sender_id.clone(),
                    sender_name,
                    body,
                    created_at,
                    read: false,
                    delivery: Delivery::Confirmed,
                };
                self.handle_new_message(conversation_id, sender_id, message, client_ref);
            }
            ServerEvent::UserTyping {
                conversation_id,
                user_id,
                is_typing,
            } => {
                let now = Instant::now();
                if self
                    .remote_typing_table
                    .apply(&conversation_id, &user_id, is_typing, now)
                {
                    self.sync_remote_typing(&conversation_id);
                    let update = if is_typing {
                        TypingUpdate::Started {
                            conversation_id,
                            user_id,
                        }
                    } else {
                        TypingUpdate::Stopped {
                            conversation_id,
                            user_id,
                        }
                    };
                    self.streams.publish_typing(update);
                    self.publish_list();
                }
            }
            ServerEvent::MessagesRead { conversation_id } => {
                if let Some(store) = self.conversations.store_mut(&conversation_id) {
                    if store.apply_messages_read() {
                        self.streams
                            .publish_receipt(ReceiptUpdate::CounterpartRead { conversation_id });
                    }
                }
            }
            // Handshake events are consumed by the connection manager and
            // never reach the live event stream.
            ServerEvent::Connected { .. } | ServerEvent::AuthError { .. } => {}
        }
    }

    fn handle_new_message(
        &mut self,
        conversation_id: String,
        sender_id: String,
        message: Message,
        client_ref: Option<String>,
    ) {
        let Some(routed) = self
            .conversations
            .route_inbound(message.clone(), client_ref.as_deref())
        else {
            debug!("Dropping event for unrelated conversation {}", conversation_id);
            return;
        };

        if routed.created_placeholder {
            self.spawn_metadata_fetch(conversation_id.clone());
        }

        match routed.outcome {
            InboundOutcome::Duplicate => {}
            InboundOutcome::Appended => {
                self.streams.publish_message(MessageUpdate::Appended {
                    conversation_id: conversation_id.clone(),
                    message,
                });
                if sender_id != self.local.user_id {
                    let now = Instant::now();
                    let (focused, unread) = self
                        .conversations
                        .store(&conversation_id)
                        .map(|s| (s.is_focused(), s.unread_count()))
                        .unwrap_or((false, 0));
                    if focused {
                        self.receipt_tracker(&conversation_id).on_inbound(now);
                    }
                    self.streams.publish_receipt(ReceiptUpdate::UnreadChanged {
                        conversation_id,
                        unread,
                    });
                }
                self.publish_list();
            }
            InboundOutcome::Reconciled { temp_id } => {
                self.streams.publish_message(MessageUpdate::Reconciled {
                    conversation_id,
                    temp_id,
                    message,
                });
                self.publish_list();
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SendMessage {
                conversation_id,
                body,
                respond_to,
            } => {
                let result = self.do_send(conversation_id, body).await;
                let _ = respond_to.send(result);
            }
            SessionCommand::ResendMessage {
                conversation_id,
                temp_id,
                respond_to,
            } => {
                let result = self.do_resend(conversation_id, temp_id).await;
                let _ = respond_to.send(result);
            }
            SessionCommand::Keystroke { conversation_id } => {
                self.do_keystroke(conversation_id).await;
            }
            SessionCommand::SetFocus {
                conversation_id,
                focused,
            } => self.do_set_focus(&conversation_id, focused),
            SessionCommand::Snapshot {
                conversation_id,
                respond_to,
            } => {
                let snapshot = self
                    .conversations
                    .store(&conversation_id)
                    .map(|s| s.messages().to_vec());
                let _ = respond_to.send(snapshot);
            }
            SessionCommand::ListConversations { respond_to } => {
                let _ = respond_to.send(self.conversations.list());
            }
        }
    }

    async fn do_send(
        &mut self,
        conversation_id: String,
        body: String,
    ) -> Result<String, ChatError> {
        // Optimistic sends are suspended while disconnected.
        if self.conn_state.borrow().status != Status::Connected {
            return Err(ChatError::ConnectionClosed);
        }

        // Sending flushes the typing debouncer immediately.
        if let Some(debouncer) = self.debouncers.get_mut(&conversation_id) {
            if debouncer.flush() == Some(TypingSignal::Stopped) {
                let _ = self
                    .connection
                    .send(ClientEvent::Typing {
                        conversation_id: conversation_id.clone(),
                        is_typing: false,
                    })
                    .await;
            }
        }

        let now = Instant::now();
        let ack_timeout = self.cfg.delivery.ack_timeout();
        let store = self
            .conversations
            .store_mut(&conversation_id)
            .ok_or_else(|| ChatError::UnknownConversation(conversation_id.clone()))?;
        let (temp_id, client_ref) =
            store.append_outbound(body.clone(), Utc::now(), now, ack_timeout);
        let pending_entry = store
            .messages()
            .iter()
            .find(|m| m.id == temp_id)
            .cloned();

        if let Some(message) = pending_entry {
            self.streams.publish_message(MessageUpdate::Appended {
                conversation_id: conversation_id.clone(),
                message,
            });
        }
        self.publish_list();

        match self
            .connection
            .send(ClientEvent::SendMessage {
                conversation_id: conversation_id.clone(),
                body,
                client_ref: client_ref.clone(),
            })
            .await
        {
            Ok(()) => Ok(temp_id),
            Err(err) => {
                // The optimistic entry stays visible as failed.
                if let Some(store) = self.conversations.store_mut(&conversation_id) {
                    if let Some(temp_id) = store.fail_send(&client_ref) {
                        self.streams.publish_message(MessageUpdate::SendFailed {
                            conversation_id: conversation_id.clone(),
                            temp_id,
                        });
                    }
                }
                self.publish_list();
                Err(err)
            }
        }
    }

    async fn do_resend(
        &mut self,
        conversation_id: String,
        temp_id: String,
    ) -> Result<(), ChatError> {
        if self.conn_state.borrow().status != Status::Connected {
            return Err(ChatError::ConnectionClosed);
        }

        let now = Instant::now();
        let ack_timeout = self.cfg.delivery.ack_timeout();
        let store = self
            .conversations
            .store_mut(&conversation_id)
            .ok_or_else(|| ChatError::UnknownConversation(conversation_id.clone()))?;
        let (client_ref, body) = store.resend(&temp_id, Utc::now(), now, ack_timeout)?;

        self.streams.publish_message(MessageUpdate::Resent {
            conversation_id: conversation_id.clone(),
            temp_id,
        });
        self.publish_list();

        match self
            .connection
            .send(ClientEvent::SendMessage {
                conversation_id: conversation_id.clone(),
                body,
                client_ref: client_ref.clone(),
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(store) = self.conversations.store_mut(&conversation_id) {
                    if let Some(temp_id) = store.fail_send(&client_ref) {
                        self.streams.publish_message(MessageUpdate::SendFailed {
                            conversation_id,
                            temp_id,
                        });
                    }
                }
                Err(err)
            }
        }
    }

    async fn do_keystroke(&mut self, conversation_id: String) {
        let quiet = self.cfg.typing.quiet_interval();
        let debouncer = self
            .debouncers
            .entry(conversation_id.clone())
            .or_insert_with(|| TypingDebouncer::new(quiet));
        if debouncer.keystroke(Instant::now()) == Some(TypingSignal::Started) {
            // Typing signals are ephemeral; a refused send is dropped.
            let _ = self
                .connection
                .send(ClientEvent::Typing {
                    conversation_id,
                    is_typing: true,
                })
                .await;
        }
    }

    fn do_set_focus(&mut self, conversation_id: &str, focused: bool) {
        let Some(store) = self.conversations.store_mut(conversation_id) else {
            debug!("Focus change for unknown conversation {}", conversation_id);
            return;
        };
        store.set_focused(focused);
        let has_unread = store.unread_count() > 0;

        let now = Instant::now();
        let tracker = self.receipt_tracker(conversation_id);
        if focused {
            tracker.on_focus(has_unread, now);
        } else {
            tracker.on_unfocus();
        }
    }

    // =========================================================================
    // Connectivity and timers
    // =========================================================================

    fn handle_connectivity(&mut self) {
        let status = self.conn_state.borrow_and_update().status;
        let connected = status == Status::Connected;

        if self.was_connected && !connected {
            // Disconnected mid-flight: pending sends become failed rather
            // than indefinitely pending. They stay visible for manual
            // resend after reconnect.
            let failed = self.conversations.fail_all_pending();
            if !failed.is_empty() {
                for (conversation_id, temp_id) in failed {
                    self.streams.publish_message(MessageUpdate::SendFailed {
                        conversation_id,
                        temp_id,
                    });
                }
                self.publish_list();
            }
        }
        self.was_connected = connected;
    }

    async fn handle_deadlines(&mut self) {
        let now = Instant::now();

        // Local typing quiet timers.
        let mut stopped: Vec<String> = Vec::new();
        for (conversation_id, debouncer) in &mut self.debouncers {
            if debouncer.on_deadline(now) == Some(TypingSignal::Stopped) {
                stopped.push(conversation_id.clone());
            }
        }
        for conversation_id in stopped {
            let _ = self
                .connection
                .send(ClientEvent::Typing {
                    conversation_id,
                    is_typing: false,
                })
                .await;
        }

        // Remote indicators expire without an explicit stop.
        let expired = self.remote_typing_table.expire(now);
        let any_expired = !expired.is_empty();
        for (conversation_id, user_id) in expired {
            self.sync_remote_typing(&conversation_id);
            self.streams.publish_typing(TypingUpdate::Stopped {
                conversation_id,
                user_id,
            });
        }

        // Read-receipt flushes.
        let due: Vec<String> = self
            .receipts
            .iter()
            .filter(|(_, tracker)| matches!(tracker.deadline(), Some(d) if d <= now))
            .map(|(conversation_id, _)| conversation_id.clone())
            .collect();
        let mut any_flushed = false;
        for conversation_id in due {
            self.flush_read_receipt(&conversation_id, now).await;
            any_flushed = true;
        }

        // Acknowledgment timeouts.
        let timed_out = self.conversations.expire_acks(now);
        let any_timed_out = !timed_out.is_empty();
        for (conversation_id, temp_id) in timed_out {
            warn!(
                "Send ack timed out for {} in {}",
                temp_id, conversation_id
            );
            self.streams.publish_message(MessageUpdate::SendFailed {
                conversation_id,
                temp_id,
            });
        }

        if any_expired || any_flushed || any_timed_out {
            self.publish_list();
        }
    }

    async fn flush_read_receipt(&mut self, conversation_id: &str, now: Instant) {
        let boundary = self
            .conversations
            .store(conversation_id)
            .and_then(|s| s.latest_message_id().map(str::to_string));
        let Some(tracker) = self.receipts.get_mut(conversation_id) else {
            return;
        };
        let Some(boundary) = tracker.flush(now, boundary.as_deref()) else {
            return;
        };

        if let Some(store) = self.conversations.store_mut(conversation_id) {
            if store.mark_read_up_to(&boundary) {
                let unread = store.unread_count();
                self.streams.publish_receipt(ReceiptUpdate::UnreadChanged {
                    conversation_id: conversation_id.to_string(),
                    unread,
                });
            }
        }
        let _ = self
            .connection
            .send(ClientEvent::MarkAsRead {
                conversation_id: conversation_id.to_string(),
            })
            .await;
    }

    // =========================================================================
    // Metadata backfill
    // =========================================================================

    fn spawn_metadata_fetch(&self, conversation_id: String) {
        let api = self.api.clone();
        let tx = self.metadata_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = api.conversation(&conversation_id) => {
                    let _ = tx.send((conversation_id, result)).await;
                }
            }
        });
    }

    fn handle_metadata(
        &mut self,
        conversation_id: String,
        result: Result<ConversationMeta, ChatError>,
    ) {
        match result {
            Ok(meta) => {
                if let Some(name) = meta.counterpart_name {
                    if self.conversations.backfill_metadata(&conversation_id, &name) {
                        self.publish_list();
                    }
                }
            }
            Err(err) => warn!("Metadata fetch for {} failed: {}", conversation_id, err),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn receipt_tracker(&mut self, conversation_id: &str) -> &mut ReadReceiptTracker {
        let window = self.cfg.delivery.read_flush();
        self.receipts
            .entry(conversation_id.to_string())
            .or_insert_with(|| ReadReceiptTracker::new(window))
    }

    fn sync_remote_typing(&mut self, conversation_id: &str) {
        let typing = self.remote_typing_table.anyone_typing_in(conversation_id);
        if let Some(store) = self.conversations.store_mut(conversation_id) {
            store.set_remote_typing(typing);
        }
    }

    fn publish_list(&self) {
        self.streams.publish_list(self.conversations.list());
    }

    /// Earliest deadline among every armed timer: send acks, local quiet
    /// intervals, read flush windows, remote typing expiry.
    fn next_deadline(&self) -> Option<Instant> {
        [
            self.conversations.ack_deadline(),
            self.remote_typing_table.next_expiry(),
            self.debouncers.values().filter_map(|d| d.deadline()).min(),
            self.receipts.values().filter_map(|t| t.deadline()).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}
