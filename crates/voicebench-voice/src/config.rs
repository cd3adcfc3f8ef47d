//! Session and vendor configuration.
//!
//! Vendor selections are closed tagged unions keyed by vendor id; required
//! fields are checked by `validate()` at construction time, before any
//! connection attempt, so a missing key or voice id fails fast instead of
//! mid-handshake.

use crate::error::{PipelineError, PipelineResult};
use crate::vad::{EnergyVadConfig, NeuralVadConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default instruction prepended to every LLM call. Replies are spoken
/// aloud, so the model is asked to keep them short.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful voice assistant. Keep responses \
concise and conversational since they will be spoken aloud. Aim for 1-3 sentences unless more \
detail is specifically requested.";

fn default_max_duration_ms() -> u64 {
    60_000
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_anthropic_base() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_deepgram_model() -> String {
    "nova-2".to_string()
}

fn default_whisper_model() -> String {
    "whisper-1".to_string()
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

fn default_tts_voice() -> String {
    "alloy".to_string()
}

fn default_elevenlabs_model() -> String {
    "eleven_turbo_v2".to_string()
}

fn require(field: &str, value: &str) -> PipelineResult<()> {
    if value.trim().is_empty() {
        return Err(PipelineError::Config(format!("{field} must not be empty")));
    }
    Ok(())
}

/// ASR vendor selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "vendor", rename_all = "snake_case")]
pub enum AsrVendor {
    /// Deepgram live streaming over a persistent WebSocket with built-in
    /// endpoint detection.
    Deepgram {
        api_key: String,
        #[serde(default = "default_deepgram_model")]
        model: String,
        #[serde(default = "default_language")]
        language: String,
    },
    /// Any OpenAI-compatible `/audio/transcriptions` endpoint (OpenAI
    /// Whisper, OpenRouter, Groq, ...). Batched: one request per
    /// VAD-detected utterance.
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        #[serde(default = "default_openai_base")]
        base_url: String,
        api_key: String,
        #[serde(default = "default_whisper_model")]
        model: String,
        #[serde(default = "default_language")]
        language: String,
    },
}

impl AsrVendor {
    /// Whether this vendor offers a duplex channel with built-in VAD. The
    /// orchestrator consults this exactly once, in `start()`.
    pub fn supports_streaming(&self) -> bool {
        matches!(self, Self::Deepgram { .. })
    }

    pub fn vendor_id(&self) -> &'static str {
        match self {
            Self::Deepgram { .. } => "deepgram",
            Self::OpenAiCompat { .. } => "openai_compat",
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        match self {
            Self::Deepgram { api_key, model, .. } => {
                require("asr.api_key", api_key)?;
                require("asr.model", model)
            }
            Self::OpenAiCompat {
                base_url,
                api_key,
                model,
                ..
            } => {
                require("asr.base_url", base_url)?;
                require("asr.api_key", api_key)?;
                require("asr.model", model)
            }
        }
    }
}

/// LLM vendor selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "vendor", rename_all = "snake_case")]
pub enum LlmVendor {
    /// Any OpenAI-compatible `/chat/completions` endpoint.
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        #[serde(default = "default_openai_base")]
        base_url: String,
        api_key: String,
        model: String,
    },
    /// Anthropic's native messages API.
    Anthropic {
        #[serde(default = "default_anthropic_base")]
        base_url: String,
        api_key: String,
        model: String,
    },
}

impl LlmVendor {
    pub fn vendor_id(&self) -> &'static str {
        match self {
            Self::OpenAiCompat { .. } => "openai_compat",
            Self::Anthropic { .. } => "anthropic",
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Self::OpenAiCompat { model, .. } | Self::Anthropic { model, .. } => model,
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        match self {
            Self::OpenAiCompat {
                base_url,
                api_key,
                model,
            }
            | Self::Anthropic {
                base_url,
                api_key,
                model,
            } => {
                require("llm.base_url", base_url)?;
                require("llm.api_key", api_key)?;
                require("llm.model", model)
            }
        }
    }
}

/// TTS vendor selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "vendor", rename_all = "snake_case")]
pub enum TtsVendor {
    /// Any OpenAI-compatible `/audio/speech` endpoint.
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        #[serde(default = "default_openai_base")]
        base_url: String,
        api_key: String,
        #[serde(default = "default_tts_model")]
        model: String,
        #[serde(default = "default_tts_voice")]
        voice: String,
    },
    /// ElevenLabs `text-to-speech/{voice_id}`.
    ElevenLabs {
        api_key: String,
        voice_id: String,
        #[serde(default = "default_elevenlabs_model")]
        model: String,
    },
}

impl TtsVendor {
    pub fn vendor_id(&self) -> &'static str {
        match self {
            Self::OpenAiCompat { .. } => "openai_compat",
            Self::ElevenLabs { .. } => "elevenlabs",
        }
    }

    pub fn voice(&self) -> &str {
        match self {
            Self::OpenAiCompat { voice, .. } => voice,
            Self::ElevenLabs { voice_id, .. } => voice_id,
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        match self {
            Self::OpenAiCompat {
                base_url,
                api_key,
                voice,
                ..
            } => {
                require("tts.base_url", base_url)?;
                require("tts.api_key", api_key)?;
                require("tts.voice", voice)
            }
            Self::ElevenLabs {
                api_key, voice_id, ..
            } => {
                require("tts.api_key", api_key)?;
                require("tts.voice_id", voice_id)
            }
        }
    }
}

/// Which local VAD strategy to run when the ASR vendor is batch-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum VadSelection {
    Energy(EnergyVadConfig),
    Neural(NeuralVadConfig),
}

impl Default for VadSelection {
    fn default() -> Self {
        Self::Neural(NeuralVadConfig::default())
    }
}

/// Full configuration for one benchmarking session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub asr: AsrVendor,
    pub llm: LlmVendor,
    pub tts: TtsVendor,
    /// Session deadline in milliseconds (default 60 s).
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    #[serde(default)]
    pub vad: VadSelection,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl SessionConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        self.asr.validate()?;
        self.llm.validate()?;
        self.tts.validate()?;
        if self.max_duration_ms == 0 {
            return Err(PipelineError::Config(
                "max_duration_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            asr: AsrVendor::Deepgram {
                api_key: "dg-key".to_string(),
                model: default_deepgram_model(),
                language: default_language(),
            },
            llm: LlmVendor::OpenAiCompat {
                base_url: default_openai_base(),
                api_key: "oa-key".to_string(),
                model: "gpt-4o".to_string(),
            },
            tts: TtsVendor::ElevenLabs {
                api_key: "el-key".to_string(),
                voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
                model: default_elevenlabs_model(),
            },
            max_duration_ms: default_max_duration_ms(),
            vad: VadSelection::default(),
            system_prompt: default_system_prompt(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(config().validate().is_ok());
        assert_eq!(config().max_duration(), Duration::from_secs(60));
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let mut cfg = config();
        cfg.llm = LlmVendor::OpenAiCompat {
            base_url: default_openai_base(),
            api_key: "  ".to_string(),
            model: "gpt-4o".to_string(),
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("llm.api_key"));
    }

    #[test]
    fn missing_voice_id_is_rejected_before_any_connection() {
        let mut cfg = config();
        cfg.tts = TtsVendor::ElevenLabs {
            api_key: "el-key".to_string(),
            voice_id: String::new(),
            model: default_elevenlabs_model(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn streaming_capability_follows_vendor() {
        assert!(config().asr.supports_streaming());
        let batch = AsrVendor::OpenAiCompat {
            base_url: default_openai_base(),
            api_key: "k".to_string(),
            model: default_whisper_model(),
            language: default_language(),
        };
        assert!(!batch.supports_streaming());
    }

    #[test]
    fn vendor_tag_round_trips() {
        let json = serde_json::to_value(&config().asr).unwrap();
        assert_eq!(json["vendor"], "deepgram");
        let back: AsrVendor = serde_json::from_value(json).unwrap();
        assert_eq!(back, config().asr);
    }

    #[test]
    fn defaults_fill_omitted_fields() {
        let raw = r#"{"vendor":"openai_compat","api_key":"k"}"#;
        let asr: AsrVendor = serde_json::from_str(raw).unwrap();
        match asr {
            AsrVendor::OpenAiCompat {
                base_url, model, ..
            } => {
                assert_eq!(base_url, "https://api.openai.com/v1");
                assert_eq!(model, "whisper-1");
            }
            other => panic!("unexpected vendor: {other:?}"),
        }
    }
}
