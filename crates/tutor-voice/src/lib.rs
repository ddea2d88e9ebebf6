//! # Tutor Voice - Push-to-Talk Realtime Voice Sessions
//!
//! This crate runs one persistent audio session against a realtime speech
//! API and drives it with client-controlled push-to-talk: the user holds to
//! speak, releases to commit, and may barge in while the tutor is answering.
//! Server-side voice activity detection is switched off.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Session engine task                      │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │   Audio In   │ → │   Capture    │ → │   Turn Controller    │  │
//! │  │ (cpal thread)│   │ (amp. gate)  │   │ Idle→Rec→Commit→…    │  │
//! │  └──────────────┘   └──────────────┘   └──────────────────────┘  │
//! │                                          ↑            ↓          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │  Audio Out   │ ← │   Playback   │ ← │ Stale filter, timers │  │
//! │  │(rodio thread)│   │  scheduler   │   │ (watchdog, cancel)   │  │
//! │  └──────────────┘   └──────────────┘   └──────────────────────┘  │
//! │                 ↕ WebSocket (JSON)          → SessionEvent        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ```no_run
//! use tutor_voice::{Session, SessionConfig, SystemAudio, WsConnector};
//!
//! # async fn demo() -> tutor_voice::VoiceResult<()> {
//! let mut session = Session::connect(SessionConfig::load()?, WsConnector::new(), SystemAudio::new()).await?;
//! let mut events = session.take_events().expect("first take");
//! session.start_recording().await?;
//! // ... user speaks ...
//! session.stop_recording().await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event.name());
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod capture;
pub mod config;
mod engine;
pub mod error;
pub mod events;
pub mod interrupt;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod timers;
pub mod transport;
pub mod turn;

pub use audio::{AudioBackend, AudioInput, AudioOutput, InputEvent, InputSpec, ManualAudio, SystemAudio};
pub use capture::{AudioChunk, CaptureAccumulator, CaptureFrame};
pub use config::{CaptureStrategy, EngineConfig, RealtimeConfig, SessionConfig};
pub use error::{SessionError, SessionErrorKind, VoiceError, VoiceResult};
pub use events::{SessionEvent, Speaker, TranscriptEvent};
pub use interrupt::StaleFilter;
pub use playback::{PlaybackScheduler, PlaybackSource};
pub use protocol::{ClientEvent, ServerEvent};
pub use session::{ConnectionState, Session};
pub use transport::{Connector, MemoryConnector, RemoteEnd, Transport, TransportEvent, WsConnector};
pub use turn::{TurnController, TurnState};
