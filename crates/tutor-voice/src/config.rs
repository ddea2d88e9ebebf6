//! Session and engine configuration.
//!
//! [`RealtimeConfig`] is what the remote session is configured with after the
//! handshake (voice, instructions, audio formats, transcription model).
//! [`EngineConfig`] holds the client-side knobs: capture gate, capture strategy,
//! and the fixed delays of the turn protocol.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | OPENAI_API_KEY | (none) | Bearer key sent on the WebSocket upgrade. |
//! | REALTIME_URL | wss://api.openai.com/v1/realtime | Endpoint, `?model=` is appended. |
//! | REALTIME_MODEL | gpt-4o-realtime-preview | Realtime model name. |
//! | REALTIME_VOICE | alloy | Output voice identity. |
//! | REALTIME_INSTRUCTIONS | tutor prompt | System instructions. |
//! | REALTIME_TRANSCRIPTION_MODEL | whisper-1 | Model used to transcribe the user. |
//! | TUTOR_VOICE__* | see `EngineConfig` | Engine overrides, `__` separated. |

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{VoiceError, VoiceResult};

pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";
pub const DEFAULT_VOICE: &str = "alloy";
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";
pub const DEFAULT_INSTRUCTIONS: &str = "You are a patient language tutor. Keep replies short, \
speak slowly and clearly, and gently correct the learner's mistakes.";

/// Wire format of audio in either direction. Only PCM16 is spoken by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Pcm16,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Pcm16 => "pcm16",
        }
    }
}

/// Remote session configuration, sent as `session.update` once the server
/// has acknowledged session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Endpoint without the model query (e.g. wss://api.openai.com/v1/realtime).
    pub url: String,
    /// Bearer API key. `None` for local or proxied endpoints.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    /// Sample rate of the PCM16 sent to the server (24 kHz for pcm16).
    pub input_sample_rate: u32,
    /// Sample rate of the PCM16 streamed back by the server.
    pub output_sample_rate: u32,
    pub transcription_model: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            input_audio_format: AudioFormat::Pcm16,
            output_audio_format: AudioFormat::Pcm16,
            input_sample_rate: 24_000,
            output_sample_rate: 24_000,
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
        }
    }
}

impl RealtimeConfig {
    /// Build from environment (see module docs). Unset values fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env_string("REALTIME_URL").unwrap_or(defaults.url),
            api_key: env_string("OPENAI_API_KEY"),
            model: env_string("REALTIME_MODEL").unwrap_or(defaults.model),
            voice: env_string("REALTIME_VOICE").unwrap_or(defaults.voice),
            instructions: env_string("REALTIME_INSTRUCTIONS").unwrap_or(defaults.instructions),
            transcription_model: env_string("REALTIME_TRANSCRIPTION_MODEL")
                .unwrap_or(defaults.transcription_model),
            ..defaults
        }
    }

    /// Set a fixed voice (e.g. "shimmer").
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    /// Full WebSocket URL including the model query.
    pub fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if base.contains('?') {
            format!("{}&model={}", base, self.model)
        } else {
            format!("{}?model={}", base, self.model)
        }
    }
}

/// How captured audio reaches the server during a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CaptureStrategy {
    /// Keep every chunk until release, then append all and commit at once.
    #[default]
    Batch,
    /// Append every `flush_every` accepted chunks while recording; commit at release.
    Streaming { flush_every: usize },
}

fn default_frame_samples() -> usize {
    4096
}

fn default_silence_threshold() -> f32 {
    0.01
}

fn default_ignore_window_ms() -> u64 {
    2_000
}

fn default_backup_cancel_delay_ms() -> u64 {
    100
}

fn default_stabilization_delay_ms() -> u64 {
    500
}

fn default_watchdog_timeout_ms() -> u64 {
    15_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_event_backlog() -> usize {
    1024
}

/// Client-side engine knobs.
///
/// | Key | Default | Description |
/// |-----|---------|-------------|
/// | capture_frame_samples | 4096 | Samples per capture frame (one `AudioChunk`). |
/// | silence_threshold | 0.01 | A frame is kept only if some sample exceeds this amplitude. |
/// | capture_strategy | batch | `batch` or `streaming` (with `flush_every`). |
/// | ignore_window_ms | 2000 | Post-interrupt window where stale messages are dropped. |
/// | backup_cancel_delay_ms | 100 | Delay before the duplicate `response.cancel`. |
/// | stabilization_delay_ms | 500 | Delay before flushing a turn that follows an interrupt. |
/// | watchdog_timeout_ms | 15000 | Max wait for the first output of a response. |
/// | connect_timeout_ms | 10000 | Transport open timeout. |
/// | handshake_timeout_ms | 10000 | Max wait for `session.created`. |
/// | event_backlog | 1024 | Undelivered events the primary receiver holds before dropping new ones. |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_frame_samples")]
    pub capture_frame_samples: usize,
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f32,
    #[serde(default)]
    pub capture_strategy: CaptureStrategy,
    #[serde(default = "default_ignore_window_ms")]
    pub ignore_window_ms: u64,
    #[serde(default = "default_backup_cancel_delay_ms")]
    pub backup_cancel_delay_ms: u64,
    #[serde(default = "default_stabilization_delay_ms")]
    pub stabilization_delay_ms: u64,
    #[serde(default = "default_watchdog_timeout_ms")]
    pub watchdog_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_event_backlog")]
    pub event_backlog: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture_frame_samples: default_frame_samples(),
            silence_threshold: default_silence_threshold(),
            capture_strategy: CaptureStrategy::default(),
            ignore_window_ms: default_ignore_window_ms(),
            backup_cancel_delay_ms: default_backup_cancel_delay_ms(),
            stabilization_delay_ms: default_stabilization_delay_ms(),
            watchdog_timeout_ms: default_watchdog_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_connect_timeout_ms(),
            event_backlog: default_event_backlog(),
        }
    }
}

impl EngineConfig {
    /// Load defaults, then the optional file named by `TUTOR_VOICE_CONFIG`
    /// (default `config/tutor-voice`), then `TUTOR_VOICE__*` environment overrides.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("TUTOR_VOICE_CONFIG").unwrap_or_else(|_| "config/tutor-voice".to_string());
        let builder = config::Config::builder();

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("TUTOR_VOICE").separator("__"))
            .build()?;

        let loaded: Self = built.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if self.capture_frame_samples == 0 {
            return Err(VoiceError::InvalidConfig(
                "capture_frame_samples must be greater than zero".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.silence_threshold) {
            return Err(VoiceError::InvalidConfig(format!(
                "silence_threshold must be in [0, 1), got {}",
                self.silence_threshold
            )));
        }
        if self.event_backlog == 0 {
            return Err(VoiceError::InvalidConfig(
                "event_backlog must be greater than zero".to_string(),
            ));
        }
        if let CaptureStrategy::Streaming { flush_every: 0 } = self.capture_strategy {
            return Err(VoiceError::InvalidConfig(
                "streaming flush_every must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ignore_window(&self) -> Duration {
        Duration::from_millis(self.ignore_window_ms)
    }

    pub fn backup_cancel_delay(&self) -> Duration {
        Duration::from_millis(self.backup_cancel_delay_ms)
    }

    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.stabilization_delay_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Everything a session needs.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub realtime: RealtimeConfig,
    pub engine: EngineConfig,
}

impl SessionConfig {
    /// `RealtimeConfig::from_env` plus `EngineConfig::load`.
    pub fn load() -> VoiceResult<Self> {
        Ok(Self {
            realtime: RealtimeConfig::from_env(),
            engine: EngineConfig::load()?,
        })
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults_match_turn_protocol() {
        let c = EngineConfig::default();
        assert_eq!(c.ignore_window(), Duration::from_secs(2));
        assert_eq!(c.backup_cancel_delay(), Duration::from_millis(100));
        assert_eq!(c.stabilization_delay(), Duration::from_millis(500));
        assert_eq!(c.watchdog_timeout(), Duration::from_secs(15));
        assert_eq!(c.capture_strategy, CaptureStrategy::Batch);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn endpoint_appends_model() {
        let c = RealtimeConfig::default();
        assert_eq!(
            c.endpoint(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
        );

        let proxied = RealtimeConfig {
            url: "ws://localhost:9000/rt?tenant=a".to_string(),
            model: "m".to_string(),
            ..Default::default()
        };
        assert_eq!(proxied.endpoint(), "ws://localhost:9000/rt?tenant=a&model=m");
    }

    #[test]
    fn rejects_zero_streaming_flush() {
        let c = EngineConfig {
            capture_strategy: CaptureStrategy::Streaming { flush_every: 0 },
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(VoiceError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_zero_event_backlog() {
        assert_eq!(EngineConfig::default().event_backlog, 1024);
        let c = EngineConfig {
            event_backlog: 0,
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(VoiceError::InvalidConfig(m)) if m.contains("event_backlog")));
    }

    #[test]
    fn with_voice_overrides_default() {
        let c = RealtimeConfig::default().with_voice("shimmer");
        assert_eq!(c.voice, "shimmer");
    }

    #[test]
    fn deserializes_partial_engine_config() {
        let c: EngineConfig = serde_json::from_str(
            r#"{"silence_threshold":0.02,"capture_strategy":{"mode":"streaming","flush_every":4}}"#,
        )
        .unwrap();
        assert!((c.silence_threshold - 0.02).abs() < 1e-6);
        assert_eq!(c.capture_strategy, CaptureStrategy::Streaming { flush_every: 4 });
        assert_eq!(c.watchdog_timeout_ms, 15_000);
    }
}
