//! Read Receipt Tracker
//!
//! Decides when "messages up to X are read" is told to the remote side
//! and prevents redundant emissions. A receipt is requested when a
//! conversation gains focus with unread messages, or when an inbound
//! message arrives while it is focused. Arrivals in quick succession
//! coalesce into one "read up to latest" emission per flush window;
//! unfocusing cancels a pending, not-yet-flushed emission.

use std::time::Duration;
use tokio::time::Instant;

pub struct ReadReceiptTracker {
    flush_window: Duration,
    focused: bool,
    /// Armed flush deadline; the window anchors at the first trigger and
    /// is not extended by later arrivals.
    pending: Option<Instant>,
    /// Last boundary actually emitted; repeats at the same boundary are
    /// suppressed.
    last_emitted: Option<String>,
}

impl ReadReceiptTracker {
    pub fn new(flush_window: Duration) -> Self {
        Self {
            flush_window,
            focused: false,
            pending: None,
            last_emitted: None,
        }
    }

    /// The conversation gained focus. Arms a flush when there is
    /// something unread to acknowledge.
    pub fn on_focus(&mut self, has_unread: bool, now: Instant) {
        self.focused = true;
        if has_unread && self.pending.is_none() {
            self.pending = Some(now + self.flush_window);
        }
    }

    /// The conversation lost focus: cancel any pending, unflushed
    /// emission. The emitted-boundary memory survives so refocusing does
    /// not re-emit an already-acknowledged boundary.
    pub fn on_unfocus(&mut self) {
        self.focused = false;
        self.pending = None;
    }

    /// An inbound message arrived. Only arms while focused; while
    /// unfocused the unread counter grows instead.
    pub fn on_inbound(&mut self, now: Instant) {
        if self.focused && self.pending.is_none() {
            self.pending = Some(now + self.flush_window);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending
    }

    /// Fire the flush if its window has elapsed. `boundary` is the
    /// current "read up to latest" target; the flush is suppressed when
    /// that boundary was already emitted.
    pub fn flush(&mut self, now: Instant, boundary: Option<&str>) -> Option<String> {
        match self.pending {
            Some(deadline) if deadline <= now => {
                self.pending = None;
                let boundary = boundary?;
                if self.last_emitted.as_deref() == Some(boundary) {
                    return None;
                }
                self.last_emitted = Some(boundary.to_string());
                Some(boundary.to_string())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn focus_with_unread_arms_one_flush() {
        let mut tracker = ReadReceiptTracker::new(ms(250));
        let t0 = Instant::now();

        tracker.on_focus(true, t0);
        assert_eq!(tracker.deadline(), Some(t0 + ms(250)));
        assert_eq!(tracker.flush(t0 + ms(249), Some("m-3")), None);
        assert_eq!(
            tracker.flush(t0 + ms(250), Some("m-3")),
            Some("m-3".to_string())
        );
        assert_eq!(tracker.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn focus_without_unread_stays_quiet() {
        let mut tracker = ReadReceiptTracker::new(ms(250));
        tracker.on_focus(false, Instant::now());
        assert_eq!(tracker.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_arrivals_coalesce_into_one_emission() {
        let mut tracker = ReadReceiptTracker::new(ms(250));
        let t0 = Instant::now();

        tracker.on_focus(false, t0);
        tracker.on_inbound(t0 + ms(10));
        tracker.on_inbound(t0 + ms(50));
        tracker.on_inbound(t0 + ms(200));

        // One window, anchored at the first arrival.
        assert_eq!(tracker.deadline(), Some(t0 + ms(260)));
        assert_eq!(
            tracker.flush(t0 + ms(260), Some("m-9")),
            Some("m-9".to_string())
        );
        assert_eq!(tracker.flush(t0 + ms(300), Some("m-9")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unfocus_cancels_a_pending_flush() {
        let mut tracker = ReadReceiptTracker::new(ms(250));
        let t0 = Instant::now();

        tracker.on_focus(true, t0);
        tracker.on_unfocus();
        assert_eq!(tracker.deadline(), None);
        assert_eq!(tracker.flush(t0 + ms(1000), Some("m-1")), None);

        // Arrivals while unfocused do not arm either.
        tracker.on_inbound(t0 + ms(1100));
        assert_eq!(tracker.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn already_emitted_boundary_is_not_repeated() {
        let mut tracker = ReadReceiptTracker::new(ms(250));
        let t0 = Instant::now();

        tracker.on_focus(true, t0);
        assert_eq!(
            tracker.flush(t0 + ms(250), Some("m-5")),
            Some("m-5".to_string())
        );

        // Refocusing with the same latest message must not re-emit.
        tracker.on_unfocus();
        tracker.on_focus(true, t0 + ms(500));
        assert_eq!(tracker.flush(t0 + ms(750), Some("m-5")), None);

        // A new boundary flows through.
        tracker.on_inbound(t0 + ms(800));
        assert_eq!(
            tracker.flush(t0 + ms(1050), Some("m-6")),
            Some("m-6".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flush_without_a_boundary_emits_nothing() {
        let mut tracker = ReadReceiptTracker::new(ms(250));
        let t0 = Instant::now();

        tracker.on_focus(true, t0);
        assert_eq!(tracker.flush(t0 + ms(250), None), None);
        // The window is consumed either way.
        assert_eq!(tracker.deadline(), None);
    }
}
