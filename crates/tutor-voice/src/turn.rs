//! Push-to-talk turn management.
//!
//! The client, not the server's VAD, decides when a user turn starts and ends.
//! `TurnController` owns the single [`TurnState`] and the optional
//! [`PendingResponse`]; every state change goes through [`TurnController::transition`],
//! which rejects moves that are not in the table below.
//!
//! ```text
//! Idle             ──start──────────▶ Recording
//! Recording        ──stop───────────▶ Committing
//! Committing       ──empty turn─────▶ Idle
//! Committing       ──flush──────────▶ AwaitingResponse
//! AwaitingResponse ──first output───▶ Responding
//! AwaitingResponse ──done/watchdog──▶ Idle
//! Responding       ──drained + done─▶ Idle
//! AwaitingResponse, Responding ──interrupt──▶ Recording
//! ```

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{VoiceError, VoiceResult};

/// Where the current turn is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Nothing in flight.
    Idle,
    /// Push-to-talk held; capture armed.
    Recording,
    /// Released; captured audio is being flushed to the server.
    Committing,
    /// `response.create` sent, no output yet.
    AwaitingResponse,
    /// The model is producing output.
    Responding,
}

impl TurnState {
    /// Transition table.
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (Idle, Recording)
                | (Recording, Committing)
                | (Committing, Idle)
                | (Committing, AwaitingResponse)
                | (AwaitingResponse, Responding)
                | (AwaitingResponse, Idle)
                | (AwaitingResponse, Recording)
                | (Responding, Idle)
                | (Responding, Recording)
        )
    }

    /// A response is pending in these states.
    pub fn has_pending_response(self) -> bool {
        matches!(self, TurnState::AwaitingResponse | TurnState::Responding)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Recording => "recording",
            TurnState::Committing => "committing",
            TurnState::AwaitingResponse => "awaiting_response",
            TurnState::Responding => "responding",
        }
    }
}

/// Metadata for the one in-flight model turn.
#[derive(Debug, Clone)]
pub struct PendingResponse {
    pub requested_at: Instant,
    /// Ties watchdog firings to this response.
    pub generation: u64,
    /// Server id, known once `response.created` arrives.
    pub response_id: Option<String>,
    /// `response.audio.done` or `response.done` seen.
    pub complete: bool,
}

/// Owns the turn state and the pending response.
#[derive(Debug)]
pub struct TurnController {
    state: TurnState,
    pending: Option<PendingResponse>,
    next_generation: u64,
    /// An interrupt happened and no stop has consumed it yet.
    interrupted: bool,
}

impl Default for TurnController {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnController {
    /// Create a controller in `Idle` with no pending response.
    pub fn new() -> Self {
        Self {
            state: TurnState::Idle,
            pending: None,
            next_generation: 1,
            interrupted: false,
        }
    }

    /// Current turn state.
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Move to `next`. Leaving the response states drops the pending response.
    pub fn transition(&mut self, next: TurnState) -> VoiceResult<TurnState> {
        let from = self.state;
        if !from.can_transition_to(next) {
            warn!(from = from.as_str(), to = next.as_str(), "rejected turn transition");
            return Err(VoiceError::InvalidTransition {
                from,
                action: transition_action(next),
            });
        }
        debug!(from = from.as_str(), to = next.as_str(), "turn transition");
        self.state = next;
        if !next.has_pending_response() {
            self.pending = None;
        }
        Ok(from)
    }

    /// Committing → AwaitingResponse, creating the pending response.
    /// Returns its generation for the watchdog.
    pub fn begin_response(&mut self, now: Instant) -> VoiceResult<u64> {
        self.transition(TurnState::AwaitingResponse)?;
        let generation = self.next_generation;
        self.next_generation += 1;
        self.pending = Some(PendingResponse {
            requested_at: now,
            generation,
            response_id: None,
            complete: false,
        });
        Ok(generation)
    }

    /// The response requested for this turn, while one is outstanding.
    pub fn pending(&self) -> Option<&PendingResponse> {
        self.pending.as_ref()
    }

    pub fn pending_mut(&mut self) -> Option<&mut PendingResponse> {
        self.pending.as_mut()
    }

    /// Remember the server id of the pending response, if it has none yet.
    pub fn bind_response_id(&mut self, id: &str) -> bool {
        match self.pending.as_mut() {
            Some(p) if p.response_id.is_none() => {
                p.response_id = Some(id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Whether `id` names the pending response.
    pub fn is_pending_id(&self, id: &str) -> bool {
        self.pending
            .as_ref()
            .and_then(|p| p.response_id.as_deref())
            .is_some_and(|p| p == id)
    }

    pub fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }

    /// Read and clear the interrupt marker.
    pub fn take_interrupted(&mut self) -> bool {
        std::mem::take(&mut self.interrupted)
    }

    /// Force Idle without validation. Used only by teardown.
    pub fn reset(&mut self) {
        self.state = TurnState::Idle;
        self.pending = None;
        self.interrupted = false;
    }
}

fn transition_action(next: TurnState) -> &'static str {
    match next {
        TurnState::Idle => "return to idle",
        TurnState::Recording => "start recording",
        TurnState::Committing => "stop recording",
        TurnState::AwaitingResponse => "request a response",
        TurnState::Responding => "start responding",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_turn_cycle() {
        let mut turn = TurnController::new();
        turn.transition(TurnState::Recording).unwrap();
        turn.transition(TurnState::Committing).unwrap();
        let generation = turn.begin_response(Instant::now()).unwrap();
        assert_eq!(generation, 1);
        assert!(turn.pending().is_some());

        turn.transition(TurnState::Responding).unwrap();
        turn.transition(TurnState::Idle).unwrap();
        assert!(turn.pending().is_none());
        assert_eq!(turn.state(), TurnState::Idle);
    }

    #[test]
    fn recording_cannot_jump_to_awaiting() {
        let mut turn = TurnController::new();
        turn.transition(TurnState::Recording).unwrap();
        let err = turn.transition(TurnState::AwaitingResponse).unwrap_err();
        assert!(matches!(
            err,
            VoiceError::InvalidTransition {
                from: TurnState::Recording,
                ..
            }
        ));
        assert_eq!(turn.state(), TurnState::Recording);
    }

    #[test]
    fn committing_blocks_new_recording() {
        let mut turn = TurnController::new();
        turn.transition(TurnState::Recording).unwrap();
        turn.transition(TurnState::Committing).unwrap();
        assert!(turn.transition(TurnState::Recording).is_err());
    }

    #[test]
    fn interrupt_drops_pending_response() {
        let mut turn = TurnController::new();
        turn.transition(TurnState::Recording).unwrap();
        turn.transition(TurnState::Committing).unwrap();
        turn.begin_response(Instant::now()).unwrap();
        assert!(turn.bind_response_id("resp_1"));
        assert!(!turn.bind_response_id("resp_2"));
        assert!(turn.is_pending_id("resp_1"));

        turn.transition(TurnState::Recording).unwrap();
        assert!(turn.pending().is_none());
        assert!(!turn.is_pending_id("resp_1"));
    }

    #[test]
    fn generations_increase_per_response() {
        let mut turn = TurnController::new();
        for expected in 1..=3 {
            turn.transition(TurnState::Recording).unwrap();
            turn.transition(TurnState::Committing).unwrap();
            assert_eq!(turn.begin_response(Instant::now()).unwrap(), expected);
            turn.transition(TurnState::Idle).unwrap();
        }
    }

    #[test]
    fn interrupt_marker_is_consumed_once() {
        let mut turn = TurnController::new();
        turn.mark_interrupted();
        assert!(turn.take_interrupted());
        assert!(!turn.take_interrupted());
    }

    #[test]
    fn only_committing_requests_a_response() {
        for from in [
            TurnState::Idle,
            TurnState::Recording,
            TurnState::Committing,
            TurnState::AwaitingResponse,
            TurnState::Responding,
        ] {
            // Committing never holds a pending response, so there is at most one.
            if from.can_transition_to(TurnState::AwaitingResponse) {
                assert_eq!(from, TurnState::Committing);
                assert!(!from.has_pending_response());
            }
        }
    }
}
