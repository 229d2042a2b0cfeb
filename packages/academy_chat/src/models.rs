//! Core data model: messages, conversations, and the local identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The signed-in user this session acts as. Authentication itself is out
/// of scope — the credential is opaque — but the core needs to know which
/// sender id is "us" to tell own messages from counterpart messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalUser {
    pub user_id: String,
    pub display_name: String,
}

/// Client-local delivery state of a stored message. Never serialized to
/// the wire: the server only ever sees confirmed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Committed server-side under a server-assigned id.
    #[default]
    Confirmed,
    /// Optimistic local entry awaiting its acknowledgment.
    Pending,
    /// Ack never arrived (timeout or disconnect). Stays visible until the
    /// user explicitly resends.
    Failed,
}

/// One message in a conversation log.
///
/// Once confirmed, a message is immutable except for its read flag. The
/// log invariant sorts ascending by `(created_at, id)`; the id tie-break
/// makes the order a deterministic total order when timestamps collide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(skip)]
    pub delivery: Delivery,
}

impl Message {
    /// The sort key of the ordering invariant.
    pub fn ordering_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// Conversation metadata as returned by the REST collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub conversation_id: String,
    #[serde(default)]
    pub counterpart_name: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: usize,
}

/// A row in the recency-ordered conversation list, derived from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation_id: String,
    /// `None` while a placeholder awaits metadata backfill; display falls
    /// back to the conversation id.
    pub counterpart_name: Option<String>,
    pub preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread: usize,
    pub remote_typing: bool,
}
