//! Realtime Event Contract
//!
//! Typed events exchanged with the platform backend over the multiplexed
//! realtime channel. One connection carries events for every conversation;
//! routing happens on `conversation_id`, and acknowledgments for in-flight
//! sends are correlated by the client-assigned `client_ref`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events sent FROM the client TO the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Opens the session. The server replies with `connected` or `auth_error`.
    Authenticate { credential: String },

    /// Send a message body to a conversation. `client_ref` is a locally
    /// generated identifier echoed back in the confirming `new_message`,
    /// so acks route to the right optimistic entry even when several
    /// conversations have sends in flight.
    SendMessage {
        conversation_id: String,
        body: String,
        client_ref: String,
    },

    /// Coalesced typing indicator. No reply is expected.
    Typing {
        conversation_id: String,
        is_typing: bool,
    },

    /// Tell the server everything in the conversation has been viewed.
    MarkAsRead { conversation_id: String },
}

/// Events sent FROM the server TO the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake accepted; the session is live.
    Connected { user_id: String },

    /// Handshake rejected. Fatal — the credential is not retried.
    AuthError { message: String },

    /// A message was committed server-side. Sent both for messages from
    /// other users and as the acknowledgment of the local client's own
    /// `send_message` (then carrying the originating `client_ref`).
    NewMessage {
        id: String,
        conversation_id: String,
        sender_id: String,
        sender_name: String,
        body: String,
        created_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
    },

    /// Another user started or stopped typing in a conversation.
    UserTyping {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },

    /// The counterpart viewed the conversation; the local client's own
    /// messages in it are now read.
    MessagesRead { conversation_id: String },
}
