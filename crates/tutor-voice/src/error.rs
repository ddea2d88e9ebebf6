//! Error types for the tutor voice engine

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::turn::TurnState;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while opening or driving a realtime session
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cannot {action} while turn is {from:?}")]
    InvalidTransition {
        from: TurnState,
        action: &'static str,
    },

    #[error("Session is closed")]
    SessionClosed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Audio payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Connection(err.to_string())
    }
}

/// Category of an error reported to the UI through [`crate::SessionEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorKind {
    /// Transport failed or closed unexpectedly. No automatic retry.
    Connection,
    /// Malformed or unexpected message, or an `error` sent by the server.
    Protocol,
    /// Microphone or speaker failure. Fatal to the session.
    AudioDevice,
    /// The watchdog cancelled a response that never produced output.
    StuckResponse,
    /// The server could not transcribe the user's utterance.
    Transcription,
}

impl SessionErrorKind {
    /// Whether the session keeps running after this error.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, SessionErrorKind::Connection | SessionErrorKind::AudioDevice)
    }
}

/// An error as delivered on the event stream.
#[derive(Debug, Clone, Serialize)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl SessionError {
    pub fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert!(SessionErrorKind::StuckResponse.is_recoverable());
        assert!(SessionErrorKind::Transcription.is_recoverable());
        assert!(SessionErrorKind::Protocol.is_recoverable());
        assert!(!SessionErrorKind::Connection.is_recoverable());
        assert!(!SessionErrorKind::AudioDevice.is_recoverable());
    }

    #[test]
    fn invalid_transition_message() {
        let err = VoiceError::InvalidTransition {
            from: TurnState::Committing,
            action: "start recording",
        };
        assert_eq!(err.to_string(), "Cannot start recording while turn is Committing");
    }
}
