//! In-memory doubles for the transport and REST collaborators.
//!
//! Used by this crate's own tests and by downstream consumers that want
//! to drive a full session without a network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::ChatError;
use crate::models::{ConversationMeta, Message};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::rest::ConversationApi;
use crate::transport::{Transport, TransportLink};

#[derive(Clone)]
enum AuthBehavior {
    Accept { user_id: String },
    Reject { message: String },
}

/// The server side of one opened link. Dropping it severs the link: the
/// client's inbound stream ends and its sends start failing, which the
/// connection manager reads as transport loss.
pub struct ServerPeer {
    /// Client events after the consumed handshake.
    pub from_client: mpsc::Receiver<ClientEvent>,
    /// Events pushed to the client.
    pub to_client: mpsc::Sender<ServerEvent>,
}

/// Scriptable in-memory transport. Every `open` yields a fresh
/// [`ServerPeer`] through the receiver returned at construction, so tests
/// control each successive connection of a reconnecting session.
pub struct MemoryTransport {
    auth: AuthBehavior,
    peers: mpsc::Sender<ServerPeer>,
    fail_opens: AtomicUsize,
}

impl MemoryTransport {
    /// A transport whose handshake accepts any credential as `user_id`.
    pub fn accepting(user_id: &str) -> (Arc<Self>, mpsc::Receiver<ServerPeer>) {
        Self::with_auth(AuthBehavior::Accept {
            user_id: user_id.to_string(),
        })
    }

    /// A transport whose handshake rejects every credential.
    pub fn rejecting(message: &str) -> (Arc<Self>, mpsc::Receiver<ServerPeer>) {
        Self::with_auth(AuthBehavior::Reject {
            message: message.to_string(),
        })
    }

    fn with_auth(auth: AuthBehavior) -> (Arc<Self>, mpsc::Receiver<ServerPeer>) {
        let (peer_tx, peer_rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                auth,
                peers: peer_tx,
                fail_opens: AtomicUsize::new(0),
            }),
            peer_rx,
        )
    }

    /// Make the next `n` opens fail with a transport error.
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<TransportLink, ChatError> {
        let should_fail = self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ChatError::Transport("simulated connect failure".into()));
        }

        let (out_tx, mut out_rx) = mpsc::channel::<ClientEvent>(64);
        let (in_tx, in_rx) = mpsc::channel::<ServerEvent>(256);
        let (forward_tx, forward_rx) = mpsc::channel::<ClientEvent>(64);

        let auth = self.auth.clone();
        let handshake_tx = in_tx.clone();
        tokio::spawn(async move {
            match out_rx.recv().await {
                Some(ClientEvent::Authenticate { .. }) => match auth {
                    AuthBehavior::Accept { user_id } => {
                        let _ = handshake_tx
                            .send(ServerEvent::Connected { user_id })
                            .await;
                    }
                    AuthBehavior::Reject { message } => {
                        let _ = handshake_tx.send(ServerEvent::AuthError { message }).await;
                        return;
                    }
                },
                _ => return,
            }
            // After the handshake the peer alone keeps the inbound side
            // open; forward the rest of the client's events to the test.
            drop(handshake_tx);
            while let Some(event) = out_rx.recv().await {
                if forward_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        let _ = self.peers.try_send(ServerPeer {
            from_client: forward_rx,
            to_client: in_tx,
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Canned-data implementation of the REST collaborators.
pub struct StaticApi {
    inner: Mutex<StaticApiState>,
}

#[derive(Default)]
struct StaticApiState {
    own_conversation: Option<ConversationMeta>,
    conversations: Vec<ConversationMeta>,
    /// Metadata resolvable by `conversation()` without appearing in the
    /// bootstrap list (conversations the session has not seen yet).
    metadata: HashMap<String, ConversationMeta>,
    pages: HashMap<String, Vec<Message>>,
}

impl StaticApi {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StaticApiState::default()),
        }
    }

    /// Set the conversation returned by `fetch_or_create_conversation`.
    pub fn set_own_conversation(&self, meta: ConversationMeta) {
        let mut inner = self.inner.lock().unwrap();
        inner.conversations.push(meta.clone());
        inner.own_conversation = Some(meta);
    }

    pub fn add_conversation(&self, meta: ConversationMeta) {
        self.inner.lock().unwrap().conversations.push(meta);
    }

    /// Make metadata resolvable without listing the conversation at
    /// bootstrap — the shape of a conversation that appears mid-session.
    pub fn set_metadata(&self, meta: ConversationMeta) {
        self.inner
            .lock()
            .unwrap()
            .metadata
            .insert(meta.conversation_id.clone(), meta);
    }

    pub fn set_page(&self, conversation_id: &str, messages: Vec<Message>) {
        self.inner
            .lock()
            .unwrap()
            .pages
            .insert(conversation_id.to_string(), messages);
    }
}

impl Default for StaticApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationApi for StaticApi {
    async fn fetch_or_create_conversation(&self) -> Result<ConversationMeta, ChatError> {
        self.inner
            .lock()
            .unwrap()
            .own_conversation
            .clone()
            .ok_or_else(|| ChatError::UnknownConversation("own conversation not seeded".into()))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationMeta>, ChatError> {
        Ok(self.inner.lock().unwrap().conversations.clone())
    }

    async fn message_page(
        &self,
        conversation_id: &str,
        _before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError> {
        let inner = self.inner.lock().unwrap();
        let mut page = inner
            .pages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        if page.len() > limit {
            page = page.split_off(page.len() - limit);
        }
        Ok(page)
    }

    async fn unread_count(&self, conversation_id: &str) -> Result<usize, ChatError> {
        let inner = self.inner.lock().unwrap();
        let count = inner
            .pages
            .get(conversation_id)
            .map(|page| page.iter().filter(|m| !m.read).count())
            .unwrap_or(0);
        Ok(count)
    }

    async fn conversation(&self, conversation_id: &str) -> Result<ConversationMeta, ChatError> {
        let inner = self.inner.lock().unwrap();
        inner
            .conversations
            .iter()
            .find(|c| c.conversation_id == conversation_id)
            .cloned()
            .or_else(|| inner.metadata.get(conversation_id).cloned())
            .ok_or_else(|| ChatError::UnknownConversation(conversation_id.to_string()))
    }
}
