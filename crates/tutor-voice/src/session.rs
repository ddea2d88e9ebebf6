//! The caller's handle on a realtime voice session.
//!
//! [`Session::connect`] opens the transport, waits for the server to create the
//! session, configures it for push-to-talk, opens the audio devices and then
//! hands everything to the engine task. The handle only sends commands and
//! reads state; dropping it tears the session down.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info};

use crate::audio::{AudioBackend, AudioInput, AudioOutput, InputEvent, InputSpec};
use crate::config::{EngineConfig, RealtimeConfig, SessionConfig};
use crate::engine::{Command, Engine, EngineIo, Reply};
use crate::error::{VoiceError, VoiceResult};
use crate::events::{EventDispatcher, SessionEvent};
use crate::protocol::{ClientEvent, ServerEvent, SessionSettings};
use crate::transport::{Connector, Transport, TransportEvent};
use crate::turn::TurnState;

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
pub struct Session {
    commands: mpsc::Sender<Command>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    fanout: broadcast::Receiver<SessionEvent>,
    turn: watch::Receiver<TurnState>,
    connection: watch::Receiver<ConnectionState>,
    engine: Option<JoinHandle<()>>,
}

impl Session {
    /// Open a session. Errors while connecting are returned here rather than
    /// emitted, since nothing can be subscribed yet.
    pub async fn connect<C, A>(config: SessionConfig, connector: C, audio: A) -> VoiceResult<Self>
    where
        C: Connector,
        A: AudioBackend,
    {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self::connect_observed(config, connector, audio, state).await
    }

    /// Like [`Session::connect`], publishing `Connecting`, `Connected` and
    /// `Disconnected` on a state channel the caller created beforehand.
    pub async fn connect_observed<C, A>(
        config: SessionConfig,
        connector: C,
        mut audio: A,
        state: watch::Sender<ConnectionState>,
    ) -> VoiceResult<Self>
    where
        C: Connector,
        A: AudioBackend,
    {
        let SessionConfig { realtime, engine } = config;
        engine.validate()?;
        state.send_replace(ConnectionState::Connecting);

        let opened = open(&realtime, &engine, &connector, &mut audio).await;
        let (transport, input, input_rx, output) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                error!("Failed to open session: {}", e);
                state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let (events, events_rx) = EventDispatcher::new(engine.event_backlog, EVENT_BUFFER);
        let fanout = events.subscribe();
        let (turn_tx, turn_rx) = watch::channel(TurnState::Idle);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        state.send_replace(ConnectionState::Connected);
        let connection = state.subscribe();
        events.emit(SessionEvent::Connected);
        info!(model = %realtime.model, voice = %realtime.voice, "session connected");

        let engine = Engine::new(
            engine,
            realtime.output_sample_rate,
            EngineIo {
                transport,
                input,
                input_rx,
                output,
                commands: command_rx,
                events,
                turn_tx,
                connection_tx: state,
            },
        );
        let handle = tokio::spawn(engine.run());

        Ok(Self {
            commands: command_tx,
            events: Some(events_rx),
            fanout,
            turn: turn_rx,
            connection,
            engine: Some(handle),
        })
    }

    /// Begin a user turn. While a response is pending this interrupts it first.
    pub async fn start_recording(&self) -> VoiceResult<()> {
        self.request(Command::StartRecording).await
    }

    /// End the user turn and ask for a response.
    pub async fn stop_recording(&self) -> VoiceResult<()> {
        self.request(Command::StopRecording).await
    }

    /// Cancel the pending response and start recording. No-op if nothing is pending.
    pub async fn interrupt(&self) -> VoiceResult<()> {
        self.request(Command::Interrupt).await
    }

    /// Close the session. Calling it again, or after the server closed, is a no-op.
    pub async fn disconnect(&mut self) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).await.is_ok() {
            let _ = rx.await;
        }
        if let Some(handle) = self.engine.take() {
            if let Err(e) = handle.await {
                error!("session engine ended abnormally: {}", e);
            }
        }
        debug!("session disconnected");
        Ok(())
    }

    /// The primary event receiver, starting at `Connected`. Can be taken once.
    ///
    /// Until it is taken, and whenever its reader falls behind, it holds at most
    /// `event_backlog` events; newer ones reach only the subscribers.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    /// An additional receiver that sees events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.fanout.resubscribe()
    }

    /// [`Session::subscribe`] as a `Stream`; lagged items surface as errors.
    pub fn subscribe_stream(&self) -> BroadcastStream<SessionEvent> {
        BroadcastStream::new(self.subscribe())
    }

    /// Latest turn state published by the engine.
    pub fn turn_state(&self) -> TurnState {
        *self.turn.borrow()
    }

    /// Follow turn state changes.
    pub fn watch_turn(&self) -> watch::Receiver<TurnState> {
        self.turn.clone()
    }

    /// Latest connection state. Becomes `Disconnected` once the engine tears down.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    async fn request(&self, command: fn(Reply) -> Command) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| VoiceError::SessionClosed)?;
        rx.await.map_err(|_| VoiceError::SessionClosed)?
    }
}

type OpenedSession = (
    Transport,
    Box<dyn AudioInput>,
    mpsc::UnboundedReceiver<InputEvent>,
    Box<dyn AudioOutput>,
);

/// Transport, create-then-configure handshake, then devices. Anything opened
/// before a failure is closed again.
async fn open<C, A>(
    realtime: &RealtimeConfig,
    engine: &EngineConfig,
    connector: &C,
    audio: &mut A,
) -> VoiceResult<OpenedSession>
where
    C: Connector,
    A: AudioBackend,
{
    info!(endpoint = %realtime.endpoint(), "connecting");
    let mut transport = timeout(engine.connect_timeout(), connector.open(realtime))
        .await
        .map_err(|_| {
            VoiceError::Connection(format!(
                "Timed out after {} ms opening the connection",
                engine.connect_timeout_ms
            ))
        })??;

    if let Err(e) = await_session_created(&mut transport, engine.handshake_timeout()).await {
        transport.close();
        return Err(e);
    }

    let update = ClientEvent::SessionUpdate {
        session: SessionSettings::from_config(realtime),
    };
    if let Err(e) = update.to_json().and_then(|json| transport.send(json)) {
        transport.close();
        return Err(e);
    }
    debug!("session.update sent");

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let spec = InputSpec {
        sample_rate: realtime.input_sample_rate,
        frame_samples: engine.capture_frame_samples,
    };
    let mut input = match audio.start_input(spec, input_tx) {
        Ok(input) => input,
        Err(e) => {
            transport.close();
            return Err(e);
        }
    };
    let output = match audio.start_output(realtime.output_sample_rate) {
        Ok(output) => output,
        Err(e) => {
            input.stop();
            transport.close();
            return Err(e);
        }
    };
    Ok((transport, input, input_rx, output))
}

async fn await_session_created(transport: &mut Transport, limit: Duration) -> VoiceResult<()> {
    timeout(limit, read_until_session_created(transport))
        .await
        .map_err(|_| {
            VoiceError::Handshake(format!(
                "No session.created within {} ms",
                limit.as_millis()
            ))
        })?
}

async fn read_until_session_created(transport: &mut Transport) -> VoiceResult<()> {
    loop {
        match transport.recv().await {
            Some(TransportEvent::Message(text)) => match ServerEvent::parse(&text)? {
                (_, ServerEvent::SessionCreated { .. }) => {
                    debug!("session.created received");
                    return Ok(());
                }
                (_, ServerEvent::Error { error }) => {
                    return Err(VoiceError::Handshake(error.message));
                }
                (kind, _) => debug!(kind = %kind, "ignoring message before session.created"),
            },
            Some(TransportEvent::Closed(reason)) => {
                return Err(VoiceError::Handshake(format!(
                    "Connection closed before the session was created ({})",
                    reason.unwrap_or_else(|| "no reason given".to_string())
                )));
            }
            Some(TransportEvent::Error(e)) => return Err(VoiceError::Connection(e)),
            None => {
                return Err(VoiceError::Handshake(
                    "Connection lost before the session was created".to_string(),
                ))
            }
        }
    }
}
