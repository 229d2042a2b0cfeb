//! Error taxonomy for the chat synchronization core.
//!
//! Authentication rejections are fatal and never retried. Transport
//! failures are transient and retried with bounded backoff until the
//! attempt budget runs out. Send failures stay local to the affected
//! message and never touch the rest of the log.

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The server rejected the credential. Never retried automatically.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The transport link failed to open or dropped. Retryable up to the
    /// configured attempt ceiling.
    #[error("transport failure: {0}")]
    Transport(String),

    /// An outbound message timed out waiting for its acknowledgment or the
    /// connection dropped mid-flight. Requires an explicit manual resend.
    #[error("send {client_ref} failed: {reason}")]
    SendFailed { client_ref: String, reason: String },

    /// The connection is not in a state that accepts outbound events.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation named a conversation this session does not hold.
    #[error("unknown conversation: {0}")]
    UnknownConversation(String),

    /// A resend was requested for a message that is not in a failed state.
    #[error("message {0} is not in a failed state")]
    NotResendable(String),

    /// A REST collaborator call failed.
    #[error("api request failed: {0}")]
    Api(#[from] reqwest::Error),
}

impl ChatError {
    /// Whether this error permanently ends the session (no automatic retry).
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChatError::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_is_fatal_transport_is_not() {
        assert!(ChatError::Auth("bad token".into()).is_fatal());
        assert!(!ChatError::Transport("connection reset".into()).is_fatal());
        assert!(!ChatError::ConnectionClosed.is_fatal());
    }

    #[test]
    fn send_failed_names_the_client_ref() {
        let err = ChatError::SendFailed {
            client_ref: "ref-1".into(),
            reason: "ack timeout".into(),
        };
        let text = err.to_string();
        assert!(text.contains("ref-1"));
        assert!(text.contains("ack timeout"));
    }
}
