//! Error types for the voicebench pipeline.
//!
//! Every failure carries enough structure to be tagged with the pipeline
//! stage it originated from; the orchestrator converts errors into tagged
//! callbacks and never lets one escape its boundary.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// The pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Asr,
    Llm,
    Tts,
    Pipeline,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Asr => "asr",
            Stage::Llm => "llm",
            Stage::Tts => "tts",
            Stage::Pipeline => "pipeline",
        };
        f.write_str(s)
    }
}

/// Errors that can occur anywhere in the voice pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("microphone unavailable: {0}")]
    Microphone(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("audio playback error: {0}")]
    Playback(String),

    #[error("VAD error: {0}")]
    Vad(String),

    #[error("{stage} connection timed out after {after:?}")]
    ConnectTimeout { stage: Stage, after: Duration },

    #[error("streaming transport error: {0}")]
    Transport(String),

    #[error("ASR request failed: {0}")]
    Asr(String),

    #[error("LLM request failed: {0}")]
    Llm(String),

    #[error("TTS request failed: {0}")]
    Tts(String),

    /// Provider quota/credit exhaustion, rewritten into a user-actionable
    /// message. Not retryable.
    #[error("{message}")]
    Quota { stage: Stage, message: String },

    #[error("channel closed: {0}")]
    Channel(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Which pipeline stage this error is attributed to. Playback failures
    /// count against the TTS leg, matching how the turn sequencer reports
    /// them.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Asr(_) | Self::Transport(_) => Stage::Asr,
            Self::ConnectTimeout { stage, .. } | Self::Quota { stage, .. } => *stage,
            Self::Llm(_) => Stage::Llm,
            Self::Tts(_) | Self::Playback(_) => Stage::Tts,
            _ => Stage::Pipeline,
        }
    }
}

impl From<cpal::DevicesError> for PipelineError {
    fn from(err: cpal::DevicesError) -> Self {
        PipelineError::Microphone(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for PipelineError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        PipelineError::Microphone(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for PipelineError {
    fn from(err: cpal::BuildStreamError) -> Self {
        PipelineError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for PipelineError {
    fn from(err: cpal::PlayStreamError) -> Self {
        PipelineError::AudioStream(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PipelineError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        PipelineError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_tagged_by_stage() {
        assert_eq!(PipelineError::Asr("x".into()).stage(), Stage::Asr);
        assert_eq!(PipelineError::Llm("x".into()).stage(), Stage::Llm);
        assert_eq!(PipelineError::Tts("x".into()).stage(), Stage::Tts);
        assert_eq!(PipelineError::Playback("x".into()).stage(), Stage::Tts);
        assert_eq!(PipelineError::Config("x".into()).stage(), Stage::Pipeline);
        assert_eq!(
            PipelineError::ConnectTimeout {
                stage: Stage::Asr,
                after: Duration::from_secs(10),
            }
            .stage(),
            Stage::Asr
        );
    }

    #[test]
    fn quota_message_passes_through() {
        let err = PipelineError::Quota {
            stage: Stage::Tts,
            message: "quota exceeded; upgrade your plan or use a new key".into(),
        };
        assert!(err.to_string().contains("upgrade"));
        assert_eq!(err.stage(), Stage::Tts);
    }
}
