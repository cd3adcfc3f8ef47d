//! # voicebench-voice — live voice-turn orchestration
//!
//! Wires interchangeable ASR, LLM, and TTS vendors into a turn-based
//! voice conversation and measures per-stage plus round-trip latency.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Session Orchestrator                      │
//! │  ┌─────────────┐   ┌──────────────┐   ┌───────────────────┐  │
//! │  │  Mic (cpal) │ → │ VAD strategy │ → │ batch ASR (HTTP)  │  │
//! │  └─────────────┘   └──────────────┘   └───────────────────┘  │
//! │        │            — or, duplex —                            │
//! │        └──────────→ streaming ASR (WebSocket, built-in VAD)   │
//! │                               ↓ finalized utterance           │
//! │                  LLM → TTS → playback (rodio)                 │
//! │                               ↓                               │
//! │            Turn record + metrics + event log                  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! One utterance is in flight at a time; utterances finalized while a
//! turn is processing are dropped. A 100 ms deadline ticker ends the
//! session at its configured maximum duration.

pub mod asr;
pub mod audio;
pub mod capture;
pub mod config;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod tts;
pub mod vad;

pub use asr::{AsrReply, BatchAsr, DuplexCapture, OpenAiCompatAsr, StreamingAsrConfig};
pub use audio::{
    encode_wav_pcm16, f32_to_i16, pcm16_bytes, AudioCapture, AudioConfig, AudioFrame,
    AudioSegment, AudioSink, RodioSink,
};
pub use capture::{CaptureEvent, CaptureStrategy, VadCapture, VadFactory};
pub use config::{
    AsrVendor, LlmVendor, SessionConfig, TtsVendor, VadSelection, DEFAULT_SYSTEM_PROMPT,
};
pub use error::{PipelineError, PipelineResult, Stage};
pub use llm::{AnthropicChat, ChatMessage, ChatModel, LlmReply, OpenAiCompatChat, Role, TokenUsage};
pub use orchestrator::{
    PipelineParts, SessionCallbacks, SessionOrchestrator, SessionState,
};
pub use tts::{ElevenLabsTts, OpenAiCompatTts, SpeechSynth, TtsAudio};
pub use vad::{
    EnergyVad, EnergyVadConfig, NeuralVad, NeuralVadConfig, SpeechModel, VadOutput, VadStrategy,
    WebRtcSpeechModel,
};
