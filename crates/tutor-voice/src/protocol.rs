//! Realtime wire protocol: JSON messages keyed by `type`.
//!
//! Client messages configure the session, manage the server-side input audio
//! buffer, and control responses. Server messages are parsed leniently: any
//! `type` this engine does not act on decodes to [`ServerEvent::Unknown`].

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::{AudioFormat, RealtimeConfig};
use crate::error::{VoiceError, VoiceResult};

/// Server error code answered to a `response.cancel` when nothing is in flight.
/// Expected after the duplicate cancel, so it is not reported.
pub const CANCEL_NOT_ACTIVE_CODE: &str = "response_cancel_not_active";

/// `session.update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub voice: String,
    pub instructions: String,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    pub input_audio_transcription: Option<TranscriptionSettings>,
    /// Always serialized as `null`: server VAD is off, the client owns turn boundaries.
    pub turn_detection: Option<serde_json::Value>,
}

impl SessionSettings {
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            voice: config.voice.clone(),
            instructions: config.instructions.clone(),
            input_audio_format: config.input_audio_format,
            output_audio_format: config.output_audio_format,
            input_audio_transcription: Some(TranscriptionSettings {
                model: config.transcription_model.clone(),
            }),
            turn_detection: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseParams {
    pub modalities: Vec<String>,
}

/// Messages sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64 little-endian PCM16.
        audio: String,
    },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<ResponseParams>,
    },

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    pub fn append(samples: &[i16]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: encode_pcm16(samples),
        }
    }

    pub fn create_response() -> Self {
        ClientEvent::ResponseCreate {
            response: Some(ResponseParams {
                modalities: vec!["audio".to_string(), "text".to_string()],
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferClear => "input_audio_buffer.clear",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::ResponseCancel => "response.cancel",
        }
    }

    /// Serialize with a fresh `event_id` for log correlation.
    pub fn to_json(&self) -> VoiceResult<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "event_id".to_string(),
                serde_json::Value::String(format!("evt_{}", uuid::Uuid::new_v4().simple())),
            );
        }
        Ok(value.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Messages received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: serde_json::Value,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: serde_json::Value,
    },

    #[serde(rename = "input_audio_buffer.cleared")]
    InputAudioBufferCleared,

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        /// Base64 little-endian PCM16.
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    InputTranscriptionFailed {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        error: ErrorDetail,
    },

    #[serde(rename = "error")]
    Error { error: ErrorDetail },

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Parse one text frame. Returns the raw `type` alongside the event so
    /// unknown messages can still be logged by name.
    pub fn parse(text: &str) -> VoiceResult<(String, ServerEvent)> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| VoiceError::Protocol(format!("invalid JSON: {}", e)))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| VoiceError::Protocol("message has no `type`".to_string()))?
            .to_string();
        let event = serde_json::from_value(value)
            .map_err(|e| VoiceError::Protocol(format!("malformed `{}`: {}", kind, e)))?;
        Ok((kind, event))
    }

    /// The response this message belongs to, when the server tags it.
    pub fn response_id(&self) -> Option<&str> {
        match self {
            ServerEvent::ResponseCreated { response } | ServerEvent::ResponseDone { response } => {
                response.id.as_deref()
            }
            ServerEvent::OutputItemAdded { response_id }
            | ServerEvent::AudioDelta { response_id, .. }
            | ServerEvent::AudioDone { response_id }
            | ServerEvent::TranscriptDelta { response_id, .. }
            | ServerEvent::TranscriptDone { response_id, .. } => response_id.as_deref(),
            _ => None,
        }
    }

    /// Messages that belong to a response's output and are subject to the
    /// post-interrupt stale filter.
    pub fn is_response_output(&self) -> bool {
        matches!(
            self,
            ServerEvent::OutputItemAdded { .. }
                | ServerEvent::ResponseDone { .. }
                | ServerEvent::AudioDelta { .. }
                | ServerEvent::AudioDone { .. }
                | ServerEvent::TranscriptDelta { .. }
                | ServerEvent::TranscriptDone { .. }
        )
    }
}

/// Encode PCM16 samples as base64 little-endian bytes.
pub fn encode_pcm16(samples: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    B64.encode(bytes)
}

/// Decode base64 little-endian PCM16. A trailing odd byte is dropped.
pub fn decode_pcm16(payload: &str) -> VoiceResult<Vec<i16>> {
    let bytes = B64.decode(payload)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Convert normalized f32 samples to PCM16, clamping to [-1.0, 1.0].
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = s.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

/// Convert PCM16 samples to normalized f32 in [-1.0, 1.0).
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_disables_turn_detection() {
        let update = ClientEvent::SessionUpdate {
            session: SessionSettings::from_config(&RealtimeConfig::default()),
        };
        let json: serde_json::Value = serde_json::from_str(&update.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "session.update");
        assert!(json["event_id"].as_str().unwrap().starts_with("evt_"));
        assert!(json["session"]["turn_detection"].is_null());
        assert!(json["session"].as_object().unwrap().contains_key("turn_detection"));
        assert_eq!(json["session"]["input_audio_format"], "pcm16");
        assert_eq!(json["session"]["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(json["session"]["voice"], "alloy");
    }

    #[test]
    fn unit_client_events_carry_only_type() {
        let json: serde_json::Value =
            serde_json::to_value(ClientEvent::InputAudioBufferCommit).unwrap();
        assert_eq!(json, serde_json::json!({"type": "input_audio_buffer.commit"}));

        // The mock server in the integration tests parses messages that carry an event_id.
        let parsed: ClientEvent = serde_json::from_str(
            &ClientEvent::ResponseCancel.to_json().unwrap(),
        )
        .unwrap();
        assert_eq!(parsed, ClientEvent::ResponseCancel);
    }

    #[test]
    fn parses_audio_delta_with_ids() {
        let (kind, event) = ServerEvent::parse(
            r#"{"type":"response.audio.delta","event_id":"e1","response_id":"resp_1","item_id":"it_1","output_index":0,"content_index":0,"delta":"AAA="}"#,
        )
        .unwrap();
        assert_eq!(kind, "response.audio.delta");
        assert_eq!(event.response_id(), Some("resp_1"));
        assert!(event.is_response_output());
    }

    #[test]
    fn unknown_types_are_not_errors() {
        let (kind, event) =
            ServerEvent::parse(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert_eq!(kind, "rate_limits.updated");
        assert_eq!(event, ServerEvent::Unknown);
    }

    #[test]
    fn malformed_messages_are_protocol_errors() {
        assert!(matches!(ServerEvent::parse("{not json"), Err(VoiceError::Protocol(_))));
        assert!(matches!(ServerEvent::parse(r#"{"no":"type"}"#), Err(VoiceError::Protocol(_))));
        assert!(matches!(
            ServerEvent::parse(r#"{"type":"response.audio.delta"}"#),
            Err(VoiceError::Protocol(_))
        ));
    }

    #[test]
    fn response_done_carries_status() {
        let (_, event) = ServerEvent::parse(
            r#"{"type":"response.done","response":{"id":"resp_9","status":"cancelled","output":[]}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::ResponseDone { response } => {
                assert_eq!(response.id.as_deref(), Some("resp_9"));
                assert_eq!(response.status.as_deref(), Some("cancelled"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn pcm16_base64_is_little_endian() {
        let encoded = encode_pcm16(&[1, -2]);
        assert_eq!(B64.decode(&encoded).unwrap(), vec![0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(decode_pcm16(&encoded).unwrap(), vec![1, -2]);
        assert!(decode_pcm16("@@not-base64@@").is_err());
    }

    #[test]
    fn f32_conversion_clamps() {
        assert_eq!(f32_to_pcm16(&[0.0, 1.0, -1.0, 2.0, -2.0]), vec![0, 32767, -32768, 32767, -32768]);
        let back = pcm16_to_f32(&[16384, -16384]);
        assert!((back[0] - 0.5).abs() < 1e-6);
        assert!((back[1] + 0.5).abs() < 1e-6);
    }
}
