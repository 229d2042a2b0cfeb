//! Multi-Conversation Coordinator
//!
//! Admin-console side: owns one store per conversation, routes inbound
//! events by conversation id, and derives a recency-ordered list. A
//! message for an unknown conversation creates a minimal placeholder
//! store immediately — the message must be visible and correctly ordered
//! before metadata resolves — and the caller backfills the counterpart
//! name asynchronously.

use std::collections::HashMap;
use tokio::time::Instant;

use crate::models::{ConversationMeta, ConversationSummary, LocalUser, Message};
use crate::store::{ConversationStore, InboundOutcome};

/// Outcome of routing one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub outcome: InboundOutcome,
    /// True when a placeholder store was created for a conversation this
    /// coordinator had never seen; the caller should fetch its metadata.
    pub created_placeholder: bool,
}

pub struct MultiConversationCoordinator {
    local: LocalUser,
    stores: HashMap<String, ConversationStore>,
}

impl MultiConversationCoordinator {
    pub fn new(local: LocalUser) -> Self {
        Self {
            local,
            stores: HashMap::new(),
        }
    }

    /// Seed a known conversation from bootstrap metadata and its first
    /// history page.
    pub fn seed(&mut self, meta: ConversationMeta, history: Vec<Message>) {
        let store = self
            .stores
            .entry(meta.conversation_id.clone())
            .or_insert_with(|| {
                ConversationStore::new(&meta.conversation_id, &self.local, None)
            });
        if let Some(name) = meta.counterpart_name {
            store.set_counterpart_name(name);
        }
        store.seed_history(history);
    }

    pub fn store(&self, conversation_id: &str) -> Option<&ConversationStore> {
        self.stores.get(conversation_id)
    }

    pub fn store_mut(&mut self, conversation_id: &str) -> Option<&mut ConversationStore> {
        self.stores.get_mut(conversation_id)
    }

    /// The store for a conversation, creating a placeholder when absent.
    pub fn ensure_store(&mut self, conversation_id: &str) -> &mut ConversationStore {
        self.stores
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationStore::placeholder(conversation_id, &self.local))
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.stores.contains_key(conversation_id)
    }

    pub fn conversation_ids(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }

    /// Route an inbound message to its store, creating a placeholder for
    /// an unknown conversation so the message is not lost.
    pub fn route_inbound(&mut self, message: Message, client_ref: Option<&str>) -> RouteOutcome {
        let conversation_id = message.conversation_id.clone();
        let created_placeholder = !self.stores.contains_key(&conversation_id);
        let store = self.ensure_store(&conversation_id);
        let outcome = store.apply_inbound(message, client_ref);
        RouteOutcome {
            outcome,
            created_placeholder,
        }
    }

    /// Fill in the counterpart name once metadata resolves. Returns true
    /// when a store was updated. Message order is untouched.
    pub fn backfill_metadata(&mut self, conversation_id: &str, counterpart_name: &str) -> bool {
        match self.stores.get_mut(conversation_id) {
            Some(store) => {
                store.set_counterpart_name(counterpart_name);
                true
            }
            None => false,
        }
    }

    /// The conversation list, sorted descending by last-message timestamp
    /// with the conversation id as deterministic tie-break. Conversations
    /// with no messages yet sort last.
    pub fn list(&self) -> Vec<ConversationSummary> {
        let mut summaries: Vec<ConversationSummary> =
            self.stores.values().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        summaries
    }

    /// Earliest outstanding acknowledgment deadline across all stores.
    pub fn ack_deadline(&self) -> Option<Instant> {
        self.stores.values().filter_map(|s| s.ack_deadline()).min()
    }

    /// Fail every in-flight send in every store (connection teardown or
    /// transport loss). Returns `(conversation_id, temp_id)` pairs.
    pub fn fail_all_pending(&mut self) -> Vec<(String, String)> {
        let mut failed = Vec::new();
        for (conversation_id, store) in &mut self.stores {
            for temp_id in store.fail_all_pending() {
                failed.push((conversation_id.clone(), temp_id));
            }
        }
        failed
    }

    /// Expire overdue acknowledgments in every store.
    pub fn expire_acks(&mut self, now: Instant) -> Vec<(String, String)> {
        let mut failed = Vec::new();
        for (conversation_id, store) in &mut self.stores {
            for temp_id in store.expire_acks(now) {
                failed.push((conversation_id.clone(), temp_id));
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Delivery;

    fn local() -> LocalUser {
        LocalUser {
            user_id: "u-admin".to_string(),
            display_name: "Admin".to_string(),
        }
    }

    fn message(conversation_id: &str, id: &str, at: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: "u-member".to_string(),
            sender_name: "Member".to_string(),
            body: format!("body of {}", id),
            created_at: at.parse().unwrap(),
            read: false,
            delivery: Delivery::Confirmed,
        }
    }

    fn meta(conversation_id: &str, name: &str) -> ConversationMeta {
        ConversationMeta {
            conversation_id: conversation_id.to_string(),
            counterpart_name: Some(name.to_string()),
            last_message_at: None,
            unread_count: 0,
        }
    }

    #[test]
    fn routes_to_the_right_store() {
        let mut coordinator = MultiConversationCoordinator::new(local());
        coordinator.seed(meta("conv-a", "Alice"), vec![]);
        coordinator.seed(meta("conv-b", "Bob"), vec![]);

        coordinator.route_inbound(message("conv-a", "m-1", "2025-03-01T12:00:00Z"), None);
        coordinator.route_inbound(message("conv-b", "m-2", "2025-03-01T12:00:01Z"), None);

        assert_eq!(coordinator.store("conv-a").unwrap().messages().len(), 1);
        assert_eq!(coordinator.store("conv-b").unwrap().messages().len(), 1);
    }

    #[test]
    fn unknown_conversation_gets_a_placeholder_immediately() {
        let mut coordinator = MultiConversationCoordinator::new(local());

        let routed =
            coordinator.route_inbound(message("conv-new", "m-1", "2025-03-01T12:00:00Z"), None);
        assert!(routed.created_placeholder);
        assert_eq!(routed.outcome, InboundOutcome::Appended);

        // Visible and ordered before metadata resolves.
        let store = coordinator.store("conv-new").unwrap();
        assert_eq!(store.messages().len(), 1);
        assert!(store.counterpart_name().is_none());
        assert_eq!(store.unread_count(), 1);

        // A second message for the same conversation is not a placeholder.
        let routed =
            coordinator.route_inbound(message("conv-new", "m-0", "2025-03-01T11:59:00Z"), None);
        assert!(!routed.created_placeholder);

        // Out-of-order arrival still lands sorted.
        let ids: Vec<&str> = coordinator
            .store("conv-new")
            .unwrap()
            .messages()
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, vec!["m-0", "m-1"]);
    }

    #[test]
    fn metadata_backfill_does_not_disturb_order() {
        let mut coordinator = MultiConversationCoordinator::new(local());
        coordinator.route_inbound(message("conv-new", "m-2", "2025-03-01T12:00:01Z"), None);
        coordinator.route_inbound(message("conv-new", "m-1", "2025-03-01T12:00:00Z"), None);

        assert!(coordinator.backfill_metadata("conv-new", "Carol"));
        let store = coordinator.store("conv-new").unwrap();
        assert_eq!(store.counterpart_name(), Some("Carol"));
        let ids: Vec<&str> = store.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-1", "m-2"]);

        // Backfill for a conversation that disappeared is a no-op.
        assert!(!coordinator.backfill_metadata("conv-gone", "Nobody"));
    }

    #[test]
    fn list_orders_by_recency_with_id_tie_break() {
        let mut coordinator = MultiConversationCoordinator::new(local());
        coordinator.seed(meta("conv-a", "Alice"), vec![]);
        coordinator.seed(meta("conv-b", "Bob"), vec![]);
        coordinator.seed(meta("conv-c", "Carol"), vec![]);

        coordinator.route_inbound(message("conv-a", "m-1", "2025-03-01T12:00:00Z"), None);
        coordinator.route_inbound(message("conv-c", "m-2", "2025-03-01T12:00:05Z"), None);
        // conv-b ties with conv-a on timestamp; id breaks the tie.
        coordinator.route_inbound(message("conv-b", "m-3", "2025-03-01T12:00:00Z"), None);

        let list = coordinator.list();
        let order: Vec<&str> = list.iter().map(|s| s.conversation_id.as_str()).collect();
        assert_eq!(order, vec!["conv-c", "conv-a", "conv-b"]);
    }

    #[test]
    fn empty_conversations_sort_last() {
        let mut coordinator = MultiConversationCoordinator::new(local());
        coordinator.seed(meta("conv-empty", "Eve"), vec![]);
        coordinator.route_inbound(message("conv-a", "m-1", "2025-03-01T12:00:00Z"), None);

        let list = coordinator.list();
        let order: Vec<&str> = list.iter().map(|s| s.conversation_id.as_str()).collect();
        assert_eq!(order, vec!["conv-a", "conv-empty"]);
    }

    #[test]
    fn list_reorders_on_every_mutation() {
        let mut coordinator = MultiConversationCoordinator::new(local());
        coordinator.route_inbound(message("conv-a", "m-1", "2025-03-01T12:00:00Z"), None);
        coordinator.route_inbound(message("conv-b", "m-2", "2025-03-01T12:00:01Z"), None);
        assert_eq!(coordinator.list()[0].conversation_id, "conv-b");

        coordinator.route_inbound(message("conv-a", "m-3", "2025-03-01T12:00:02Z"), None);
        assert_eq!(coordinator.list()[0].conversation_id, "conv-a");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sends_route_acks_by_client_ref() {
        use std::time::Duration;

        let mut coordinator = MultiConversationCoordinator::new(local());
        coordinator.seed(meta("conv-a", "Alice"), vec![]);
        coordinator.seed(meta("conv-b", "Bob"), vec![]);

        let now = Instant::now();
        let (_temp_a, ref_a) = coordinator.store_mut("conv-a").unwrap().append_outbound(
            "to alice".to_string(),
            "2025-03-01T12:00:00Z".parse().unwrap(),
            now,
            Duration::from_secs(10),
        );
        let (_temp_b, ref_b) = coordinator.store_mut("conv-b").unwrap().append_outbound(
            "to bob".to_string(),
            "2025-03-01T12:00:00Z".parse().unwrap(),
            now,
            Duration::from_secs(10),
        );

        // Acks arrive in the opposite order, each carrying its ref.
        let mut ack_b = message("conv-b", "m-b1", "2025-03-01T12:00:01Z");
        ack_b.sender_id = "u-admin".to_string();
        let routed = coordinator.route_inbound(ack_b, Some(&ref_b));
        assert!(matches!(routed.outcome, InboundOutcome::Reconciled { .. }));

        let mut ack_a = message("conv-a", "m-a1", "2025-03-01T12:00:01Z");
        ack_a.sender_id = "u-admin".to_string();
        let routed = coordinator.route_inbound(ack_a, Some(&ref_a));
        assert!(matches!(routed.outcome, InboundOutcome::Reconciled { .. }));

        assert_eq!(coordinator.store("conv-a").unwrap().messages()[0].id, "m-a1");
        assert_eq!(coordinator.store("conv-b").unwrap().messages()[0].id, "m-b1");
        assert!(coordinator.ack_deadline().is_none());
    }
}
