//! Typing Debouncer
//!
//! Converts raw keystroke activity into coalesced start/stop typing
//! signals: at most one start per idle→typing edge and one stop per
//! typing→idle edge, never a signal per keystroke. Remote indicators are
//! tracked with a refresh stamp and expired locally, so a lost remote
//! stop event cannot leave a stale "typing…" indicator forever.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Edge signal produced by the local debouncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Started,
    Stopped,
}

#[derive(Clone, Copy)]
enum DebounceState {
    Idle,
    Typing { quiet_deadline: Instant },
}

/// Local-side debouncer for one (conversation, local user) pair.
pub struct TypingDebouncer {
    quiet_interval: Duration,
    state: DebounceState,
}

impl TypingDebouncer {
    pub fn new(quiet_interval: Duration) -> Self {
        Self {
            quiet_interval,
            state: DebounceState::Idle,
        }
    }

    /// A keystroke happened. Emits `Started` on the idle→typing edge;
    /// otherwise just re-arms the quiet timer.
    pub fn keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        let deadline = now + self.quiet_interval;
        match self.state {
            DebounceState::Idle => {
                self.state = DebounceState::Typing {
                    quiet_deadline: deadline,
                };
                Some(TypingSignal::Started)
            }
            DebounceState::Typing { .. } => {
                self.state = DebounceState::Typing {
                    quiet_deadline: deadline,
                };
                None
            }
        }
    }

    /// The message was sent: flush an immediate stop and disarm the
    /// timer, even if the quiet interval has not elapsed.
    pub fn flush(&mut self) -> Option<TypingSignal> {
        match self.state {
            DebounceState::Typing { .. } => {
                self.state = DebounceState::Idle;
                Some(TypingSignal::Stopped)
            }
            DebounceState::Idle => None,
        }
    }

    /// The pending quiet deadline, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Typing { quiet_deadline } => Some(quiet_deadline),
            DebounceState::Idle => None,
        }
    }

    /// Fire the quiet timer if it has elapsed.
    pub fn on_deadline(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.state {
            DebounceState::Typing { quiet_deadline } if quiet_deadline <= now => {
                self.state = DebounceState::Idle;
                Some(TypingSignal::Stopped)
            }
            _ => None,
        }
    }
}

/// Remote typing indicators across all conversations, keyed by
/// (conversation, user), each carrying its last refresh instant.
pub struct RemoteTypingTable {
    expiry: Duration,
    entries: HashMap<(String, String), Instant>,
}

impl RemoteTypingTable {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            entries: HashMap::new(),
        }
    }

    /// Apply an inbound typing event. Returns true when the visible state
    /// of that (conversation, user) pair changed.
    pub fn apply(
        &mut self,
        conversation_id: &str,
        user_id: &str,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        let key = (conversation_id.to_string(), user_id.to_string());
        if is_typing {
            self.entries.insert(key, now).is_none()
        } else {
            self.entries.remove(&key).is_some()
        }
    }

    /// Whether anyone is typing in the conversation.
    pub fn anyone_typing_in(&self, conversation_id: &str) -> bool {
        self.entries.keys().any(|(c, _)| c == conversation_id)
    }

    /// The next instant at which an entry expires, if any.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.values().map(|&at| at + self.expiry).min()
    }

    /// Drop entries whose refresh is older than the expiry window,
    /// treating them as stopped. Returns the expired pairs.
    pub fn expire(&mut self, now: Instant) -> Vec<(String, String)> {
        let expiry = self.expiry;
        let expired: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|&(_, &at)| at + expiry <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }
}
