//! The session engine.
//!
//! One task owns the turn controller, capture accumulator, stale filter,
//! playback scheduler and timers, and reacts to four inputs in arrival order:
//! commands from the [`crate::Session`] handle, server messages, capture frames
//! and timer firings. Nothing here is shared, so nothing is locked.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioInput, AudioOutput, InputEvent};
use crate::capture::CaptureAccumulator;
use crate::config::EngineConfig;
use crate::error::{SessionError, SessionErrorKind, VoiceResult};
use crate::events::{EventDispatcher, SessionEvent, Speaker, TranscriptEvent};
use crate::interrupt::StaleFilter;
use crate::playback::{buffer_duration, PlaybackScheduler};
use crate::protocol::{decode_pcm16, pcm16_to_f32, ClientEvent, ServerEvent, CANCEL_NOT_ACTIVE_CODE};
use crate::session::ConnectionState;
use crate::timers::{TimerFiring, TimerKind, TimerSet};
use crate::transport::{Transport, TransportEvent};
use crate::turn::{TurnController, TurnState};

pub(crate) type Reply = oneshot::Sender<VoiceResult<()>>;

pub(crate) enum Command {
    StartRecording(Reply),
    StopRecording(Reply),
    Interrupt(Reply),
    Disconnect(oneshot::Sender<()>),
}

/// Channels and devices the engine takes ownership of.
pub(crate) struct EngineIo {
    pub transport: Transport,
    pub input: Box<dyn AudioInput>,
    pub input_rx: mpsc::UnboundedReceiver<InputEvent>,
    pub output: Box<dyn AudioOutput>,
    pub commands: mpsc::Receiver<Command>,
    pub events: EventDispatcher,
    pub turn_tx: watch::Sender<TurnState>,
    pub connection_tx: watch::Sender<ConnectionState>,
}

pub(crate) struct Engine {
    config: EngineConfig,
    output_sample_rate: u32,

    transport: Transport,
    input: Box<dyn AudioInput>,
    input_rx: mpsc::UnboundedReceiver<InputEvent>,
    output: Box<dyn AudioOutput>,
    commands: mpsc::Receiver<Command>,
    events: EventDispatcher,
    turn_tx: watch::Sender<TurnState>,
    connection_tx: watch::Sender<ConnectionState>,
    timers: TimerSet,
    timer_rx: mpsc::UnboundedReceiver<TimerFiring>,

    turn: TurnController,
    capture: CaptureAccumulator,
    stale: StaleFilter,
    playback: PlaybackScheduler,
    /// Model transcript of the current response so far.
    model_transcript: String,
    /// A `response.cancel` went out and its `response.done` has not come back.
    awaiting_cancel_ack: bool,
    closed: bool,
}

impl Engine {
    pub(crate) fn new(config: EngineConfig, output_sample_rate: u32, io: EngineIo) -> Self {
        let (timers, timer_rx) = TimerSet::new();
        let capture = CaptureAccumulator::new(config.silence_threshold, config.capture_strategy);
        Self {
            config,
            output_sample_rate,
            transport: io.transport,
            input: io.input,
            input_rx: io.input_rx,
            output: io.output,
            commands: io.commands,
            events: io.events,
            turn_tx: io.turn_tx,
            connection_tx: io.connection_tx,
            timers,
            timer_rx,
            turn: TurnController::new(),
            capture,
            stale: StaleFilter::new(),
            playback: PlaybackScheduler::new(),
            model_transcript: String::new(),
            awaiting_cancel_ack: false,
            closed: false,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("session engine started");
        while !self.closed {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.teardown("session handle dropped"),
                },
                event = self.transport.recv() => self.handle_transport(event),
                Some(input) = self.input_rx.recv() => self.handle_input(input),
                Some(firing) = self.timer_rx.recv() => self.handle_timer(firing),
            }
        }
        debug!("session engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartRecording(reply) => {
                let _ = reply.send(self.start_recording());
            }
            Command::StopRecording(reply) => {
                let _ = reply.send(self.stop_recording());
            }
            Command::Interrupt(reply) => {
                let _ = reply.send(self.interrupt());
            }
            Command::Disconnect(reply) => {
                self.teardown("disconnect requested");
                let _ = reply.send(());
            }
        }
    }

    // Turn commands

    fn start_recording(&mut self) -> VoiceResult<()> {
        match self.turn.state() {
            TurnState::Recording => {
                debug!("already recording");
                Ok(())
            }
            TurnState::AwaitingResponse | TurnState::Responding => self.barge_in(),
            // Idle succeeds; Committing is rejected by the transition table.
            TurnState::Idle | TurnState::Committing => self.enter_recording(),
        }
    }

    fn enter_recording(&mut self) -> VoiceResult<()> {
        self.set_turn(TurnState::Recording)?;
        self.send(ClientEvent::InputAudioBufferClear)?;
        self.capture.arm();
        self.events.emit(SessionEvent::RecordingChanged(true));
        Ok(())
    }

    fn stop_recording(&mut self) -> VoiceResult<()> {
        let state = self.turn.state();
        if state != TurnState::Recording {
            debug!(state = state.as_str(), "stop ignored, not recording");
            return Ok(());
        }
        self.capture.disarm();
        self.set_turn(TurnState::Committing)?;
        self.events.emit(SessionEvent::RecordingChanged(false));

        if self.turn.take_interrupted() {
            debug!(
                delay_ms = self.config.stabilization_delay_ms,
                "waiting for the server to settle before committing"
            );
            self.timers
                .arm(TimerKind::Stabilization, self.config.stabilization_delay());
            return Ok(());
        }
        self.flush_turn()
    }

    /// Send the captured turn and request a response, or return to Idle if
    /// nothing audible was captured.
    fn flush_turn(&mut self) -> VoiceResult<()> {
        let total = self.capture.turn_chunk_count();
        let chunks = self.capture.drain();

        if total == 0 {
            info!("nothing captured, turn not committed");
            self.set_turn(TurnState::Idle)?;
            self.events.emit(SessionEvent::NothingCaptured);
            return Ok(());
        }

        let samples: usize = chunks.iter().map(|c| c.len()).sum();
        info!(chunks = total, unsent = chunks.len(), samples, "committing turn");
        for chunk in &chunks {
            self.send(ClientEvent::append(&chunk.samples))?;
        }
        self.send(ClientEvent::InputAudioBufferCommit)?;
        self.send(ClientEvent::create_response())?;

        self.model_transcript.clear();
        let generation = self.turn.begin_response(Instant::now())?;
        self.publish_turn(TurnState::AwaitingResponse);
        self.timers.arm(
            TimerKind::Watchdog { generation },
            self.config.watchdog_timeout(),
        );
        Ok(())
    }

    fn interrupt(&mut self) -> VoiceResult<()> {
        if !self.turn.state().has_pending_response() {
            debug!(state = self.turn.state().as_str(), "interrupt ignored, no response pending");
            return Ok(());
        }
        self.barge_in()
    }

    /// Cancel the pending response, silence playback and start a new recording.
    fn barge_in(&mut self) -> VoiceResult<()> {
        let now = Instant::now();
        let (cancelled_id, generation) = match self.turn.pending() {
            Some(p) => (p.response_id.clone(), Some(p.generation)),
            None => (None, None),
        };
        info!(
            response_id = cancelled_id.as_deref().unwrap_or("unknown"),
            state = self.turn.state().as_str(),
            "interrupting response"
        );

        self.stale
            .open_window(now, self.config.ignore_window(), cancelled_id.as_deref());
        if let Some(generation) = generation {
            self.timers.cancel(TimerKind::Watchdog { generation });
        }

        self.send(ClientEvent::ResponseCancel)?;
        self.awaiting_cancel_ack = true;
        self.timers
            .arm(TimerKind::BackupCancel, self.config.backup_cancel_delay());

        self.stop_playback(now);
        self.model_transcript.clear();
        self.turn.mark_interrupted();
        self.enter_recording()?;
        self.events.emit(SessionEvent::Interrupted);
        Ok(())
    }

    // Transport

    fn handle_transport(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message(text)) => self.handle_message(&text),
            Some(TransportEvent::Closed(reason)) => {
                let message = match reason {
                    Some(reason) => format!("Connection closed by server: {}", reason),
                    None => "Connection closed by server".to_string(),
                };
                self.fail(SessionErrorKind::Connection, message);
            }
            Some(TransportEvent::Error(e)) => {
                self.fail(SessionErrorKind::Connection, format!("Connection error: {}", e));
            }
            None => self.fail(SessionErrorKind::Connection, "Connection lost"),
        }
    }

    fn handle_message(&mut self, text: &str) {
        let (kind, event) = match ServerEvent::parse(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.report(SessionErrorKind::Protocol, e.to_string());
                return;
            }
        };
        let now = Instant::now();

        // The cancelled response's own `response.done` is the ack, and is then filtered out.
        if let ServerEvent::ResponseDone { response } = &event {
            self.note_cancel_ack(response.id.as_deref(), now);
        }

        if event.is_response_output() {
            let verdict =
                self.stale
                    .verdict(event.response_id(), |id| self.turn.is_pending_id(id), now);
            if verdict.is_drop() {
                debug!(kind = %kind, ?verdict, "dropping stale response message");
                return;
            }
            if let (Some(id), Some(bound)) = (event.response_id(), self.bound_response_id()) {
                if id != bound {
                    debug!(kind = %kind, response_id = id, "dropping message for another response");
                    return;
                }
            }
        }

        debug!(kind = %kind, "server message");
        match event {
            ServerEvent::SessionCreated { .. } => debug!("repeated session.created ignored"),
            ServerEvent::SessionUpdated { .. } => info!("session configuration applied"),
            ServerEvent::InputAudioBufferCleared => {}
            ServerEvent::InputAudioBufferCommitted { item_id } => {
                debug!(item_id = item_id.as_deref().unwrap_or(""), "input audio committed");
            }
            ServerEvent::ResponseCreated { response } => self.on_response_created(response.id, now),
            ServerEvent::OutputItemAdded { .. } => self.on_first_output(),
            ServerEvent::AudioDelta { delta, .. } => self.on_audio_delta(&delta, now),
            ServerEvent::AudioDone { .. } => self.on_response_complete("response.audio.done"),
            ServerEvent::TranscriptDelta { delta, .. } => {
                self.on_first_output();
                self.model_transcript.push_str(&delta);
                let text = self.model_transcript.clone();
                self.emit_transcript(Speaker::Model, text, false);
            }
            ServerEvent::TranscriptDone { transcript, .. } => {
                let accumulated = std::mem::take(&mut self.model_transcript);
                let text = if transcript.is_empty() { accumulated } else { transcript };
                self.emit_transcript(Speaker::Model, text, true);
            }
            ServerEvent::ResponseDone { response } => {
                if response.status.as_deref() == Some("failed") {
                    warn!(response_id = response.id.as_deref().unwrap_or(""), "response failed");
                }
                self.on_response_complete("response.done");
            }
            ServerEvent::InputTranscriptionCompleted { transcript, .. } => {
                self.emit_transcript(Speaker::User, transcript.trim().to_string(), true);
            }
            ServerEvent::InputTranscriptionFailed { error, .. } => {
                let message = if error.message.is_empty() {
                    "Could not transcribe the recording".to_string()
                } else {
                    format!("Could not transcribe the recording: {}", error.message)
                };
                self.report(SessionErrorKind::Transcription, message);
            }
            ServerEvent::Error { error } => {
                if error.code.as_deref() == Some(CANCEL_NOT_ACTIVE_CODE) {
                    debug!("server had no active response to cancel");
                } else {
                    self.report(
                        SessionErrorKind::Protocol,
                        format!("Server error: {}", error.message),
                    );
                }
            }
            ServerEvent::Unknown => debug!(kind = %kind, "ignoring unhandled message type"),
        }
    }

    fn bound_response_id(&self) -> Option<&str> {
        self.turn.pending().and_then(|p| p.response_id.as_deref())
    }

    fn note_cancel_ack(&mut self, response_id: Option<&str>, now: Instant) {
        if !self.awaiting_cancel_ack {
            return;
        }
        let acked = match response_id {
            Some(id) => self.stale.is_cancelled(id),
            None => self.stale.in_window(now),
        };
        if acked {
            debug!("cancellation acknowledged");
            self.awaiting_cancel_ack = false;
            self.timers.cancel(TimerKind::BackupCancel);
        }
    }

    fn on_response_created(&mut self, response_id: Option<String>, now: Instant) {
        let Some(id) = response_id else {
            return;
        };
        if self.stale.is_cancelled(&id) {
            return;
        }
        match self.turn.state() {
            TurnState::AwaitingResponse | TurnState::Responding => {
                if self.turn.bind_response_id(&id) {
                    debug!(response_id = %id, "response bound to turn");
                } else if !self.turn.is_pending_id(&id) {
                    warn!(response_id = %id, "unexpected second response for this turn");
                }
            }
            _ if self.stale.in_window(now) => {
                debug!(response_id = %id, "late response.created for an interrupted turn");
                self.stale.mark_cancelled(&id);
            }
            state => debug!(state = state.as_str(), response_id = %id, "response created outside a turn"),
        }
    }

    fn on_first_output(&mut self) {
        if self.turn.state() != TurnState::AwaitingResponse {
            return;
        }
        if let Some(pending) = self.turn.pending() {
            let generation = pending.generation;
            debug!(
                waited_ms = pending.requested_at.elapsed().as_millis() as u64,
                "first output received"
            );
            self.timers.cancel(TimerKind::Watchdog { generation });
        }
        self.set_turn_or_warn(TurnState::Responding);
    }

    /// Play one output fragment. Stale audio never gets here, so anything that
    /// passed the filter is played in any turn state.
    fn on_audio_delta(&mut self, delta: &str, now: Instant) {
        self.on_first_output();

        let pcm = match decode_pcm16(delta) {
            Ok(pcm) => pcm,
            Err(e) => {
                self.report(SessionErrorKind::Protocol, e.to_string());
                return;
            }
        };
        if pcm.is_empty() {
            return;
        }
        let samples = pcm16_to_f32(&pcm);
        let source = self
            .playback
            .schedule(buffer_duration(samples.len(), self.output_sample_rate), now);

        self.events.emit(SessionEvent::AudioDelta {
            samples: samples.clone(),
            sample_rate: self.output_sample_rate,
        });
        if let Err(e) = self.output.play(samples) {
            self.fail(SessionErrorKind::AudioDevice, format!("Audio output failed: {}", e));
            return;
        }
        self.timers.arm_at(TimerKind::SourceEnded(source.id), source.end());
    }

    fn on_response_complete(&mut self, marker: &'static str) {
        match self.turn.state() {
            TurnState::AwaitingResponse => {
                info!(marker, "response finished without output");
                if let Some(generation) = self.turn.pending().map(|p| p.generation) {
                    self.timers.cancel(TimerKind::Watchdog { generation });
                }
                self.set_turn_or_warn(TurnState::Idle);
            }
            TurnState::Responding => {
                if let Some(pending) = self.turn.pending_mut() {
                    if !pending.complete {
                        debug!(marker, "response complete");
                    }
                    pending.complete = true;
                }
                self.finish_response_if_drained();
            }
            state => debug!(marker, state = state.as_str(), "completion outside a response"),
        }
    }

    /// Back to Idle once the response is complete and the last source ended.
    fn finish_response_if_drained(&mut self) {
        let complete = self.turn.pending().is_some_and(|p| p.complete);
        if self.turn.state() == TurnState::Responding && complete && self.playback.is_idle() {
            info!("response finished playing");
            self.set_turn_or_warn(TurnState::Idle);
        }
    }

    // Capture

    fn handle_input(&mut self, input: InputEvent) {
        match input {
            InputEvent::Frame(frame) => {
                if !self.capture.push_frame(&frame.samples) {
                    return;
                }
                for chunk in self.capture.take_ready() {
                    if let Err(e) = self.send(ClientEvent::append(&chunk.samples)) {
                        warn!("streaming append failed: {}", e);
                        break;
                    }
                }
            }
            InputEvent::Failed(message) => {
                self.fail(
                    SessionErrorKind::AudioDevice,
                    format!("Audio input failed: {}", message),
                );
            }
        }
    }

    // Timers

    fn handle_timer(&mut self, firing: TimerFiring) {
        if !self.timers.accept(firing) {
            return;
        }
        match firing.kind {
            TimerKind::Watchdog { generation } => self.on_watchdog(generation),
            TimerKind::BackupCancel => {
                if std::mem::take(&mut self.awaiting_cancel_ack) {
                    info!("cancellation not acknowledged, sending response.cancel again");
                    if let Err(e) = self.send(ClientEvent::ResponseCancel) {
                        warn!("backup cancel failed: {}", e);
                    }
                }
            }
            TimerKind::Stabilization => {
                if self.turn.state() == TurnState::Committing {
                    if let Err(e) = self.flush_turn() {
                        warn!("commit after interrupt failed: {}", e);
                    }
                }
            }
            TimerKind::SourceEnded(id) => {
                if self.playback.finish(id) {
                    self.finish_response_if_drained();
                }
            }
        }
    }

    fn on_watchdog(&mut self, generation: u64) {
        let stuck = self.turn.state() == TurnState::AwaitingResponse
            && self.turn.pending().is_some_and(|p| p.generation == generation);
        if !stuck {
            return;
        }
        let response_id = self.bound_response_id().map(str::to_string);
        warn!(
            response_id = response_id.as_deref().unwrap_or("unknown"),
            timeout_ms = self.config.watchdog_timeout_ms,
            "no output from the model, cancelling response"
        );

        self.stale.open_window(
            Instant::now(),
            self.config.ignore_window(),
            response_id.as_deref(),
        );
        for event in [ClientEvent::ResponseCancel, ClientEvent::InputAudioBufferClear] {
            if let Err(e) = self.send(event) {
                warn!("watchdog cleanup failed: {}", e);
            }
        }
        self.set_turn_or_warn(TurnState::Idle);
        self.report(
            SessionErrorKind::StuckResponse,
            format!(
                "The model did not respond within {} seconds",
                self.config.watchdog_timeout().as_secs()
            ),
        );
    }

    // Helpers

    fn send(&mut self, event: ClientEvent) -> VoiceResult<()> {
        let text = event.to_json()?;
        debug!(kind = event.kind(), "client message");
        self.transport.send(text)
    }

    fn set_turn(&mut self, next: TurnState) -> VoiceResult<()> {
        self.turn.transition(next)?;
        self.publish_turn(next);
        Ok(())
    }

    fn set_turn_or_warn(&mut self, next: TurnState) {
        if let Err(e) = self.set_turn(next) {
            warn!("{}", e);
        }
    }

    fn publish_turn(&mut self, state: TurnState) {
        self.turn_tx.send_replace(state);
        self.events.emit(SessionEvent::TurnChanged(state));
    }

    fn emit_transcript(&self, speaker: Speaker, text: String, is_complete: bool) {
        self.events
            .emit(SessionEvent::Transcript(TranscriptEvent::new(speaker, text, is_complete)));
    }

    fn stop_playback(&mut self, now: Instant) {
        let dropped = self.playback.stop_all(now);
        for id in &dropped {
            self.timers.cancel(TimerKind::SourceEnded(*id));
        }
        self.output.stop_all();
        debug!(sources = dropped.len(), "playback stopped");
    }

    fn report(&self, kind: SessionErrorKind, message: impl Into<String>) {
        let err = SessionError::new(kind, message);
        if err.is_recoverable() {
            warn!(kind = ?err.kind, "{}", err.message);
        } else {
            error!(kind = ?err.kind, "{}", err.message);
        }
        self.events.emit(SessionEvent::Error(err));
    }

    fn fail(&mut self, kind: SessionErrorKind, message: impl Into<String>) {
        if self.closed {
            return;
        }
        self.report(kind, message);
        self.teardown("fatal error");
    }

    /// Release everything and emit `Disconnected`. Runs once.
    fn teardown(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!(reason, "closing session");

        self.timers.abort_all();
        self.capture.disarm();
        self.capture.reset();
        self.input.stop();

        self.playback.stop_all(Instant::now());
        self.output.stop_all();
        self.output.close();
        self.transport.close();

        let was = self.turn.state();
        self.turn.reset();
        self.awaiting_cancel_ack = false;
        if was == TurnState::Recording {
            self.events.emit(SessionEvent::RecordingChanged(false));
        }
        if was != TurnState::Idle {
            self.publish_turn(TurnState::Idle);
        }

        self.connection_tx.send_replace(ConnectionState::Disconnected);
        self.events.emit(SessionEvent::Disconnected);
    }
}
