//! Session events and their delivery.
//!
//! Every observable change is a [`SessionEvent`]. The dispatcher delivers each
//! event to one primary receiver (taken once from the session, so events
//! emitted between connect and subscription are kept) and to any number of
//! broadcast subscribers, which skip ahead if they lag. The primary channel
//! holds at most `backlog` undelivered events; past that, new events are
//! dropped from it and only subscribers see them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{trace, warn};

use crate::error::SessionError;
use crate::turn::TurnState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEvent {
    pub speaker: Speaker,
    /// For the model, the text accumulated so far in the current response.
    pub text: String,
    pub is_complete: bool,
    pub at: DateTime<Utc>,
}

impl TranscriptEvent {
    pub fn new(speaker: Speaker, text: impl Into<String>, is_complete: bool) -> Self {
        Self {
            speaker,
            text: text.into(),
            is_complete,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected,
    Disconnected,
    RecordingChanged(bool),
    TurnChanged(TurnState),
    /// A decoded output fragment, handed out as it is scheduled for playback.
    AudioDelta {
        samples: Vec<f32>,
        sample_rate: u32,
    },
    Transcript(TranscriptEvent),
    /// The user released push-to-talk without any audible input.
    NothingCaptured,
    Interrupted,
    Error(SessionError),
}

impl SessionEvent {
    /// Stable snake_case name, matching the serialized `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Connected => "connected",
            SessionEvent::Disconnected => "disconnected",
            SessionEvent::RecordingChanged(_) => "recording_changed",
            SessionEvent::TurnChanged(_) => "turn_changed",
            SessionEvent::AudioDelta { .. } => "audio_delta",
            SessionEvent::Transcript(_) => "transcript",
            SessionEvent::NothingCaptured => "nothing_captured",
            SessionEvent::Interrupted => "interrupted",
            SessionEvent::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventDispatcher {
    primary: mpsc::Sender<SessionEvent>,
    fanout: broadcast::Sender<SessionEvent>,
}

impl EventDispatcher {
    /// `backlog` bounds the primary receiver, `capacity` each subscriber.
    pub fn new(backlog: usize, capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (primary, primary_rx) = mpsc::channel(backlog.max(1));
        let (fanout, _) = broadcast::channel(capacity.max(1));
        (Self { primary, fanout }, primary_rx)
    }

    /// Deliver to every receiver without waiting on any of them.
    pub fn emit(&self, event: SessionEvent) {
        trace!(event = event.name(), "emit");
        let _ = self.fanout.send(event.clone());
        match self.primary.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event = event.name(), "primary event receiver is full, event dropped");
            }
            // Taken and dropped by the caller.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// A new subscriber that sees events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.fanout.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn primary_receiver_sees_events_emitted_before_it_is_read() {
        let (dispatcher, mut rx) = EventDispatcher::new(8, 8);
        dispatcher.emit(SessionEvent::Connected);
        dispatcher.emit(SessionEvent::RecordingChanged(true));

        assert!(matches!(rx.recv().await, Some(SessionEvent::Connected)));
        assert!(matches!(rx.recv().await, Some(SessionEvent::RecordingChanged(true))));
    }

    #[tokio::test]
    async fn subscribers_get_their_own_copy() {
        let (dispatcher, _rx) = EventDispatcher::new(8, 8);
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();
        dispatcher.emit(SessionEvent::Interrupted);

        assert!(matches!(a.recv().await, Ok(SessionEvent::Interrupted)));
        assert!(matches!(b.recv().await, Ok(SessionEvent::Interrupted)));
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let (dispatcher, _rx) = EventDispatcher::new(8, 2);
        let mut slow = dispatcher.subscribe();
        for _ in 0..5 {
            dispatcher.emit(SessionEvent::NothingCaptured);
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert!(matches!(slow.recv().await, Ok(SessionEvent::NothingCaptured)));
    }

    #[tokio::test]
    async fn unread_primary_receiver_holds_at_most_the_backlog() {
        let (dispatcher, mut rx) = EventDispatcher::new(3, 16);
        let mut sub = dispatcher.subscribe();
        for _ in 0..10 {
            dispatcher.emit(SessionEvent::AudioDelta {
                samples: vec![0.1; 2400],
                sample_rate: 24_000,
            });
        }
        dispatcher.emit(SessionEvent::Interrupted);

        let mut held = 0;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.name(), "audio_delta");
            held += 1;
        }
        assert_eq!(held, 3);

        // Subscribers are unaffected by the full primary channel.
        for _ in 0..10 {
            assert!(matches!(sub.recv().await, Ok(SessionEvent::AudioDelta { .. })));
        }
        assert!(matches!(sub.recv().await, Ok(SessionEvent::Interrupted)));

        // Once drained, the primary receiver picks up again.
        dispatcher.emit(SessionEvent::NothingCaptured);
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::NothingCaptured)));
    }

    #[test]
    fn emit_after_primary_receiver_dropped_is_silent() {
        let (dispatcher, rx) = EventDispatcher::new(1, 1);
        drop(rx);
        dispatcher.emit(SessionEvent::Connected);
        dispatcher.emit(SessionEvent::Disconnected);
    }

    #[test]
    fn serializes_with_event_tag() {
        let json = serde_json::to_value(SessionEvent::TurnChanged(TurnState::AwaitingResponse)).unwrap();
        assert_eq!(json["event"], "turn_changed");
        assert_eq!(json["data"], "awaiting_response");
    }
}
