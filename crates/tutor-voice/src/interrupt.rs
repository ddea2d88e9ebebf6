//! Barge-in support: deciding which inbound response messages are stale.
//!
//! After an interrupt the server keeps streaming the cancelled response for a
//! while. Messages are dropped when they name a cancelled response, or when they
//! arrive inside the ignore window without naming the response this client
//! requested afterwards. Identity wins over time whenever the server tags
//! messages with a response id; untagged messages fall back to the window.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Cancelled response ids remembered for identity filtering.
const CANCELLED_HISTORY: usize = 8;

/// What to do with one inbound response message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    /// Tagged with the id of a cancelled response.
    DropCancelled,
    /// Arrived inside the post-interrupt ignore window.
    DropWindow,
}

impl Verdict {
    pub fn is_drop(self) -> bool {
        !matches!(self, Verdict::Deliver)
    }
}

#[derive(Debug, Default)]
pub struct StaleFilter {
    ignore_until: Option<Instant>,
    cancelled: VecDeque<String>,
}

impl StaleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start ignoring output until `now + window`; remember `cancelled_id` if known.
    pub fn open_window(&mut self, now: Instant, window: Duration, cancelled_id: Option<&str>) {
        self.ignore_until = Some(now + window);
        if let Some(id) = cancelled_id {
            self.mark_cancelled(id);
        }
    }

    /// Remember `id` as cancelled. Only the most recent ids are kept.
    pub fn mark_cancelled(&mut self, id: &str) {
        if self.is_cancelled(id) {
            return;
        }
        if self.cancelled.len() == CANCELLED_HISTORY {
            self.cancelled.pop_front();
        }
        self.cancelled.push_back(id.to_string());
    }

    /// Whether `id` names a response this client cancelled.
    pub fn is_cancelled(&self, id: &str) -> bool {
        self.cancelled.iter().any(|c| c == id)
    }

    /// Whether `now` falls inside the post-interrupt ignore window.
    pub fn in_window(&self, now: Instant) -> bool {
        self.ignore_until.is_some_and(|until| now < until)
    }

    /// Judge a message tagged with `response_id` (if any). `is_requested` tells
    /// whether an id belongs to the response this client asked for after the
    /// interrupt.
    pub fn verdict(
        &self,
        response_id: Option<&str>,
        is_requested: impl Fn(&str) -> bool,
        now: Instant,
    ) -> Verdict {
        if let Some(id) = response_id {
            if self.is_cancelled(id) {
                return Verdict::DropCancelled;
            }
        }
        if self.in_window(now) {
            return match response_id {
                Some(id) if is_requested(id) => Verdict::Deliver,
                _ => Verdict::DropWindow,
            };
        }
        Verdict::Deliver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(2);

    fn none(_: &str) -> bool {
        false
    }

    #[test]
    fn nothing_dropped_before_any_interrupt() {
        let filter = StaleFilter::new();
        let now = Instant::now();
        assert_eq!(filter.verdict(None, none, now), Verdict::Deliver);
        assert_eq!(filter.verdict(Some("resp_1"), none, now), Verdict::Deliver);
    }

    #[test]
    fn untagged_messages_follow_the_window() {
        let mut filter = StaleFilter::new();
        let t0 = Instant::now();
        filter.open_window(t0, WINDOW, None);

        assert_eq!(filter.verdict(None, none, t0), Verdict::DropWindow);
        assert_eq!(
            filter.verdict(None, none, t0 + Duration::from_millis(1999)),
            Verdict::DropWindow
        );
        assert_eq!(filter.verdict(None, none, t0 + WINDOW), Verdict::Deliver);
    }

    #[test]
    fn cancelled_ids_are_dropped_after_the_window() {
        let mut filter = StaleFilter::new();
        let t0 = Instant::now();
        filter.open_window(t0, WINDOW, Some("resp_old"));

        let late = t0 + Duration::from_secs(5);
        assert_eq!(filter.verdict(Some("resp_old"), none, late), Verdict::DropCancelled);
        assert_eq!(filter.verdict(Some("resp_new"), none, late), Verdict::Deliver);
    }

    #[test]
    fn requested_response_passes_inside_the_window() {
        let mut filter = StaleFilter::new();
        let t0 = Instant::now();
        filter.open_window(t0, WINDOW, Some("resp_old"));

        let is_requested = |id: &str| id == "resp_new";
        let soon = t0 + Duration::from_millis(700);
        assert_eq!(filter.verdict(Some("resp_new"), is_requested, soon), Verdict::Deliver);
        assert_eq!(filter.verdict(Some("resp_other"), is_requested, soon), Verdict::DropWindow);
        assert_eq!(filter.verdict(Some("resp_old"), is_requested, soon), Verdict::DropCancelled);
    }

    #[test]
    fn cancelled_history_is_bounded() {
        let mut filter = StaleFilter::new();
        for i in 0..(CANCELLED_HISTORY + 2) {
            filter.mark_cancelled(&format!("resp_{}", i));
        }
        assert!(!filter.is_cancelled("resp_0"));
        assert!(!filter.is_cancelled("resp_1"));
        assert!(filter.is_cancelled(&format!("resp_{}", CANCELLED_HISTORY + 1)));
    }
}
