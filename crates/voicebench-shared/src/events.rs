//! Append-only session event log.
//!
//! Every notable moment in a session (audio arriving, transcripts
//! finalizing, LLM/TTS progress, errors) is recorded as an [`Event`] with
//! an epoch-ms timestamp. Events are never mutated or removed; the ordered
//! list is the input to the event-based metrics in [`crate::metrics`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    UserRequested,
    Timeout,
    Error,
}

/// The closed set of event kinds, tagged the way they appear on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    SessionStart {
        #[serde(rename = "systemPrompt")]
        system_prompt: String,
        #[serde(rename = "llmModel")]
        llm_model: String,
        #[serde(rename = "ttsVoice")]
        tts_voice: String,
    },
    SessionEnd {
        reason: SessionEndReason,
        #[serde(rename = "duration")]
        duration_ms: u64,
    },
    AudioChunkReceived {
        size: usize,
    },
    AsrPartial {
        text: String,
    },
    AsrFinal {
        text: String,
        /// Epoch-ms timestamp at which the user stopped speaking.
        #[serde(rename = "speechEndTime")]
        speech_end_ms: i64,
    },
    LlmStart {
        prompt: String,
    },
    LlmToken {
        token: String,
        #[serde(rename = "isFirst")]
        is_first: bool,
    },
    LlmComplete {
        #[serde(rename = "fullText")]
        full_text: String,
        #[serde(rename = "tokensInput")]
        tokens_input: u64,
        #[serde(rename = "tokensOutput")]
        tokens_output: u64,
    },
    TtsStart {
        text: String,
        #[serde(rename = "characterCount")]
        character_count: usize,
    },
    TtsAudioChunk {
        size: usize,
        #[serde(rename = "isFirst")]
        is_first: bool,
    },
    TtsComplete {
        #[serde(rename = "totalChunks")]
        total_chunks: usize,
        #[serde(rename = "totalSize")]
        total_size: usize,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        code: Option<String>,
    },
}

/// One immutable log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// The full ordered log for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub events: Vec<Event>,
}

/// Collects timestamped events for one session. Append-only.
#[derive(Debug)]
pub struct EventLogger {
    session_id: String,
    events: Mutex<Vec<Event>>,
}

impl EventLogger {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Record an event stamped with the current wall-clock time.
    pub fn log(&self, kind: EventKind) {
        self.log_at(Utc::now().timestamp_millis(), kind);
    }

    /// Record an event with an explicit timestamp (offline replay, tests).
    pub fn log_at(&self, timestamp_ms: i64, kind: EventKind) {
        let event = Event {
            session_id: self.session_id.clone(),
            timestamp_ms,
            kind,
        };
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event);
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Snapshot of the events recorded so far, in order.
    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn event_log(&self) -> EventLog {
        EventLog {
            session_id: self.session_id.clone(),
            events: self.events(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_preserves_order_and_session_id() {
        let logger = EventLogger::new("s-1");
        logger.log(EventKind::AudioChunkReceived { size: 4096 });
        logger.log(EventKind::AsrPartial {
            text: "hel".to_string(),
        });

        let events = logger.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.session_id == "s-1"));
        assert!(matches!(
            events[0].kind,
            EventKind::AudioChunkReceived { size: 4096 }
        ));
        assert!(events[0].timestamp_ms <= events[1].timestamp_ms);
    }

    #[test]
    fn event_serializes_with_type_and_data_tags() {
        let event = Event {
            session_id: "s-9".to_string(),
            timestamp_ms: 1000,
            kind: EventKind::AsrFinal {
                text: "hello there".to_string(),
                speech_end_ms: 900,
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "asr_final");
        assert_eq!(json["data"]["text"], "hello there");
        assert_eq!(json["data"]["speechEndTime"], 900);
        assert_eq!(json["sessionId"], "s-9");
        assert_eq!(json["timestamp"], 1000);

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn session_end_reason_uses_snake_case() {
        let json = serde_json::to_value(SessionEndReason::UserRequested).unwrap();
        assert_eq!(json, "user_requested");
    }
}
