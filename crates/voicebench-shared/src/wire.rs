//! Client↔server wire messages for the remote benchmarking variant.
//!
//! JSON over a persistent message channel. Every message carries an
//! epoch-ms `timestamp`; audio payloads travel base64-encoded. A session
//! always ends with exactly one `session_ended`, whether by user request,
//! timeout, or error.

use crate::events::SessionEndReason;
use crate::metrics::SessionMetrics;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Encode raw audio bytes for a JSON payload.
pub fn encode_audio(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a base64 audio payload.
pub fn decode_audio(payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(payload)
}

/// API keys supplied by the client at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeys {
    pub deepgram: String,
    pub openai: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub elevenlabs: Option<String>,
}

/// Optional model/voice overrides in `start_session`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub llm_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tts_voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tts_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionPayload {
    pub api_keys: ApiKeys,
    pub system_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub config: Option<SessionOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioChunkPayload {
    /// Base64-encoded PCM.
    pub audio: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyPayload {}

/// Messages the client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartSession {
        payload: StartSessionPayload,
        timestamp: i64,
    },
    AudioChunk {
        payload: AudioChunkPayload,
        timestamp: i64,
    },
    EndSession {
        #[serde(default)]
        payload: EmptyPayload,
        timestamp: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartedPayload {
    pub session_id: String,
    /// Seconds.
    pub max_duration: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptPayload {
    pub text: String,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmTokenPayload {
    pub token: String,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEndedPayload {
    pub reason: SessionEndReason,
    pub metrics: SessionMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
}

/// Messages the server sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionStarted {
        payload: SessionStartedPayload,
        timestamp: i64,
    },
    TranscriptPartial {
        payload: TranscriptPayload,
        timestamp: i64,
    },
    TranscriptFinal {
        payload: TranscriptPayload,
        timestamp: i64,
    },
    LlmToken {
        payload: LlmTokenPayload,
        timestamp: i64,
    },
    TtsAudio {
        payload: AudioChunkPayload,
        timestamp: i64,
    },
    SessionEnded {
        payload: SessionEndedPayload,
        timestamp: i64,
    },
    Error {
        payload: ErrorPayload,
        timestamp: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_session_round_trips() {
        let msg = ClientMessage::StartSession {
            payload: StartSessionPayload {
                api_keys: ApiKeys {
                    deepgram: "dg".to_string(),
                    openai: "oa".to_string(),
                    elevenlabs: None,
                },
                system_prompt: "be brief".to_string(),
                config: Some(SessionOptions {
                    llm_model: Some("gpt-4o".to_string()),
                    tts_voice: None,
                    tts_provider: Some("openai-tts".to_string()),
                }),
            },
            timestamp: 1234,
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "start_session");
        assert_eq!(json["payload"]["apiKeys"]["deepgram"], "dg");
        assert_eq!(json["payload"]["systemPrompt"], "be brief");
        assert_eq!(json["payload"]["config"]["llmModel"], "gpt-4o");
        assert_eq!(json["timestamp"], 1234);

        let back: ClientMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn audio_chunk_carries_base64() {
        let pcm = [0u8, 1, 2, 255];
        let msg = ClientMessage::AudioChunk {
            payload: AudioChunkPayload {
                audio: encode_audio(&pcm),
            },
            timestamp: 7,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::AudioChunk { payload, .. } => {
                assert_eq!(decode_audio(&payload.audio).unwrap(), pcm);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn session_ended_tag_and_reason() {
        let msg = ServerMessage::SessionEnded {
            payload: SessionEndedPayload {
                reason: SessionEndReason::Timeout,
                metrics: SessionMetrics::default(),
            },
            timestamp: 99,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "session_ended");
        assert_eq!(json["payload"]["reason"], "timeout");
    }

    #[test]
    fn end_session_with_empty_payload_parses() {
        let raw = r#"{"type":"end_session","payload":{},"timestamp":42}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ClientMessage::EndSession { timestamp: 42, .. }));
    }
}
