//! Typed update streams, one per concern.
//!
//! The presentation layer observes committed state through these streams
//! instead of attaching ad hoc listeners: connectivity flows through the
//! connection manager's watch channel, everything else through the
//! broadcast channels bundled here. Reducers publish; views subscribe.

use tokio::sync::broadcast;

use crate::models::{ConversationSummary, Message};

/// Mutations of a conversation's message log.
#[derive(Debug, Clone)]
pub enum MessageUpdate {
    /// A message (inbound, or an optimistic local send) entered the log.
    Appended {
        conversation_id: String,
        message: Message,
    },
    /// An optimistic entry was replaced in place by its server-confirmed
    /// message.
    Reconciled {
        conversation_id: String,
        temp_id: String,
        message: Message,
    },
    /// An optimistic entry failed (ack timeout or disconnect) and awaits
    /// an explicit resend.
    SendFailed {
        conversation_id: String,
        temp_id: String,
    },
    /// A failed entry was re-armed for another attempt.
    Resent {
        conversation_id: String,
        temp_id: String,
    },
}

/// Remote typing indicator edges.
#[derive(Debug, Clone)]
pub enum TypingUpdate {
    Started {
        conversation_id: String,
        user_id: String,
    },
    Stopped {
        conversation_id: String,
        user_id: String,
    },
}

/// Read-state changes.
#[derive(Debug, Clone)]
pub enum ReceiptUpdate {
    /// The local unread counter changed (recomputed, not drifted).
    UnreadChanged {
        conversation_id: String,
        unread: usize,
    },
    /// The counterpart viewed the conversation; our messages are read.
    CounterpartRead { conversation_id: String },
}

/// Bundle of the per-concern broadcast senders.
#[derive(Clone)]
pub struct EventStreams {
    messages: broadcast::Sender<MessageUpdate>,
    typing: broadcast::Sender<TypingUpdate>,
    receipts: broadcast::Sender<ReceiptUpdate>,
    list: broadcast::Sender<Vec<ConversationSummary>>,
}

impl EventStreams {
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(256);
        let (typing, _) = broadcast::channel(64);
        let (receipts, _) = broadcast::channel(64);
        let (list, _) = broadcast::channel(64);
        Self {
            messages,
            typing,
            receipts,
            list,
        }
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessageUpdate> {
        self.messages.subscribe()
    }

    pub fn subscribe_typing(&self) -> broadcast::Receiver<TypingUpdate> {
        self.typing.subscribe()
    }

    pub fn subscribe_receipts(&self) -> broadcast::Receiver<ReceiptUpdate> {
        self.receipts.subscribe()
    }

    pub fn subscribe_list(&self) -> broadcast::Receiver<Vec<ConversationSummary>> {
        self.list.subscribe()
    }

    // Publishing ignores the no-receiver case: streams are observation
    // points, not required consumers.

    pub(crate) fn publish_message(&self, update: MessageUpdate) {
        let _ = self.messages.send(update);
    }

    pub(crate) fn publish_typing(&self, update: TypingUpdate) {
        let _ = self.typing.send(update);
    }

    pub(crate) fn publish_receipt(&self, update: ReceiptUpdate) {
        let _ = self.receipts.send(update);
    }

    pub(crate) fn publish_list(&self, list: Vec<ConversationSummary>) {
        let _ = self.list.send(list);
    }
}

impl Default for EventStreams {
    fn default() -> Self {
        Self::new()
    }
}
