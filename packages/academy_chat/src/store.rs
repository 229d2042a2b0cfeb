//! Conversation Store
//!
//! Per-conversation ordered message log, unread counter, and typing flag.
//! The log is always sorted ascending by `(created_at, id)` regardless of
//! delivery order; the id tie-break makes the order a deterministic total
//! order. The unread counter is recomputed from the log on every
//! mutation, never incrementally drifted.
//!
//! The store is a pure state machine: it takes explicit timestamps and
//! instants and never does IO, so every transition is unit-testable. The
//! session's event pump owns the clocks and the wire.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ChatError;
use crate::models::{ConversationSummary, Delivery, LocalUser, Message};

/// What happened to an inbound `new_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Inserted at its ordered position.
    Appended,
    /// The id was already stored; the call was a no-op.
    Duplicate,
    /// The event acknowledged one of our optimistic sends; the temporary
    /// entry was replaced in place by the confirmed message.
    Reconciled { temp_id: String },
}

/// An optimistic send awaiting its acknowledgment.
struct PendingSend {
    temp_id: String,
    deadline: Instant,
}

pub struct ConversationStore {
    conversation_id: String,
    local_user_id: String,
    local_display_name: String,
    counterpart_name: Option<String>,
    log: Vec<Message>,
    ids: HashSet<String>,
    /// In-flight sends keyed by `client_ref`.
    pending: HashMap<String, PendingSend>,
    /// Failed sends keyed by `client_ref`. A late acknowledgment still
    /// reconciles the failed draft instead of appearing next to it.
    failed_refs: HashMap<String, String>,
    unread: usize,
    focused: bool,
    remote_typing: bool,
}

impl ConversationStore {
    pub fn new(
        conversation_id: impl Into<String>,
        local: &LocalUser,
        counterpart_name: Option<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            local_user_id: local.user_id.clone(),
            local_display_name: local.display_name.clone(),
            counterpart_name,
            log: Vec::new(),
            ids: HashSet::new(),
            pending: HashMap::new(),
            failed_refs: HashMap::new(),
            unread: 0,
            focused: false,
            remote_typing: false,
        }
    }

    /// Minimal store created when an event arrives for a conversation we
    /// have never seen; metadata is backfilled asynchronously.
    pub fn placeholder(conversation_id: impl Into<String>, local: &LocalUser) -> Self {
        Self::new(conversation_id, local, None)
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn counterpart_name(&self) -> Option<&str> {
        self.counterpart_name.as_deref()
    }

    pub fn set_counterpart_name(&mut self, name: impl Into<String>) {
        self.counterpart_name = Some(name.into());
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    pub fn set_focused(&mut self, focused: bool) {
        self.focused = focused;
    }

    pub fn remote_typing(&self) -> bool {
        self.remote_typing
    }

    pub fn set_remote_typing(&mut self, typing: bool) {
        self.remote_typing = typing;
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    pub fn messages(&self) -> &[Message] {
        &self.log
    }

    pub fn latest_message_id(&self) -> Option<&str> {
        self.log.last().map(|m| m.id.as_str())
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        self.log.last().map(|m| m.created_at)
    }

    /// Seed the log from a paginated history fetch. Idempotent per id.
    pub fn seed_history(&mut self, messages: Vec<Message>) {
        for message in messages {
            if !self.ids.contains(&message.id) {
                self.insert_sorted(message);
            }
        }
        self.recompute_unread();
    }

    /// Insert an inbound message at the position dictated by the
    /// `(created_at, id)` tie-break — not necessarily the tail. A message
    /// whose id is already stored is a no-op. When `client_ref` names one
    /// of our in-flight sends, the optimistic entry is replaced in place
    /// so reconciliation never produces a duplicate visible entry.
    pub fn apply_inbound(&mut self, message: Message, client_ref: Option<&str>) -> InboundOutcome {
        if let Some(reference) = client_ref {
            let temp_id = match self.pending.remove(reference) {
                Some(pending) => Some(pending.temp_id),
                None => self.failed_refs.remove(reference),
            };
            if let Some(temp_id) = temp_id {
                self.remove_entry(&temp_id);
                self.failed_refs.retain(|_, t| t != &temp_id);
                if !self.ids.contains(&message.id) {
                    self.insert_sorted(Message {
                        delivery: Delivery::Confirmed,
                        ..message
                    });
                }
                self.recompute_unread();
                return InboundOutcome::Reconciled { temp_id };
            }
        }

        if self.ids.contains(&message.id) {
            return InboundOutcome::Duplicate;
        }
        self.insert_sorted(message);
        self.recompute_unread();
        InboundOutcome::Appended
    }

    /// Append an optimistic, unconfirmed entry under a temporary id and
    /// arm its acknowledgment deadline. Returns `(temp_id, client_ref)`.
    pub fn append_outbound(
        &mut self,
        body: String,
        created_at: DateTime<Utc>,
        now: Instant,
        ack_timeout: Duration,
    ) -> (String, String) {
        let temp_id = format!("tmp-{}", Uuid::new_v4());
        let client_ref = Uuid::new_v4().to_string();
        self.insert_sorted(Message {
            id: temp_id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.local_user_id.clone(),
            sender_name: self.local_display_name.clone(),
            body,
            created_at,
            read: false,
            delivery: Delivery::Pending,
        });
        self.pending.insert(
            client_ref.clone(),
            PendingSend {
                temp_id: temp_id.clone(),
                deadline: now + ack_timeout,
            },
        );
        (temp_id, client_ref)
    }

    /// Re-arm a failed entry for another attempt under a fresh
    /// `client_ref` and a fresh timestamp. Only failed entries are
    /// resendable; automatic resend is disallowed elsewhere to avoid
    /// duplicate delivery.
    pub fn resend(
        &mut self,
        temp_id: &str,
        created_at: DateTime<Utc>,
        now: Instant,
        ack_timeout: Duration,
    ) -> Result<(String, String), ChatError> {
        let pos = self
            .log
            .iter()
            .position(|m| m.id == temp_id)
            .ok_or_else(|| ChatError::NotResendable(temp_id.to_string()))?;
        if self.log[pos].delivery != Delivery::Failed {
            return Err(ChatError::NotResendable(temp_id.to_string()));
        }

        let mut entry = self.log.remove(pos);
        self.ids.remove(&entry.id);
        entry.created_at = created_at;
        entry.delivery = Delivery::Pending;
        let body = entry.body.clone();
        self.insert_sorted(entry);

        let client_ref = Uuid::new_v4().to_string();
        self.pending.insert(
            client_ref.clone(),
            PendingSend {
                temp_id: temp_id.to_string(),
                deadline: now + ack_timeout,
            },
        );
        Ok((client_ref, body))
    }

    /// Set every remote-sender message up to and including the boundary
    /// to read and recompute the unread count. Returns true when the
    /// boundary actually advanced — the caller emits at most one
    /// read-receipt per distinct advance.
    pub fn mark_read_up_to(&mut self, upto_id: &str) -> bool {
        let Some(boundary) = self.log.iter().position(|m| m.id == upto_id) else {
            return false;
        };
        let mut advanced = false;
        for message in &mut self.log[..=boundary] {
            if message.sender_id != self.local_user_id && !message.read {
                message.read = true;
                advanced = true;
            }
        }
        if advanced {
            self.recompute_unread();
        }
        advanced
    }

    /// The counterpart viewed the conversation: our own messages are now
    /// read. Returns true when any flag changed.
    pub fn apply_messages_read(&mut self) -> bool {
        let mut changed = false;
        for message in &mut self.log {
            if message.sender_id == self.local_user_id && !message.read {
                message.read = true;
                changed = true;
            }
        }
        changed
    }

    /// Earliest outstanding acknowledgment deadline, if any.
    pub fn ack_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Mark every send whose deadline has passed as failed. Returns the
    /// temp ids of the newly failed entries.
    pub fn expire_acks(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(reference, _)| reference.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|reference| self.fail_send(&reference))
            .collect()
    }

    /// The connection dropped: every in-flight send is failed rather than
    /// left indefinitely pending. Returns the temp ids of failed entries.
    pub fn fail_all_pending(&mut self) -> Vec<String> {
        let references: Vec<String> = self.pending.keys().cloned().collect();
        references
            .into_iter()
            .filter_map(|reference| self.fail_send(&reference))
            .collect()
    }

    /// Fail one in-flight send by its `client_ref` (e.g. the wire refused
    /// it outright). Returns the temp id of the failed entry.
    pub fn fail_send(&mut self, reference: &str) -> Option<String> {
        let pending = self.pending.remove(reference)?;
        if let Some(entry) = self.log.iter_mut().find(|m| m.id == pending.temp_id) {
            entry.delivery = Delivery::Failed;
        }
        self.failed_refs
            .insert(reference.to_string(), pending.temp_id.clone());
        Some(pending.temp_id)
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            conversation_id: self.conversation_id.clone(),
            counterpart_name: self.counterpart_name.clone(),
            preview: self.log.last().map(|m| m.body.clone()),
            last_message_at: self.last_message_at(),
            unread: self.unread,
            remote_typing: self.remote_typing,
        }
    }

    fn insert_sorted(&mut self, message: Message) {
        let key = (message.created_at, message.id.clone());
        let pos = self
            .log
            .partition_point(|m| m.ordering_key() < (key.0, key.1.as_str()));
        self.ids.insert(key.1);
        self.log.insert(pos, message);
    }

    fn remove_entry(&mut self, id: &str) {
        if let Some(pos) = self.log.iter().position(|m| m.id == id) {
            self.log.remove(pos);
            self.ids.remove(id);
        }
    }

    fn recompute_unread(&mut self) {
        self.unread = self
            .log
            .iter()
            .filter(|m| !m.read && m.sender_id != self.local_user_id)
            .count();
    }
}
