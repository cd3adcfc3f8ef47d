//! Speech-to-text clients.
//!
//! Two shapes: [`BatchAsr`] for request/response vendors (one WAV upload
//! per VAD-detected utterance) and the duplex streaming path in
//! [`streaming`] for vendors with a persistent transcription channel.

pub mod streaming;

pub use streaming::{DuplexCapture, StreamingAsrConfig};

use crate::error::{PipelineError, PipelineResult, Stage};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;
use voicebench_shared::StageMetrics;

/// A finished batch transcription.
#[derive(Debug, Clone)]
pub struct AsrReply {
    pub transcript: String,
    pub metrics: StageMetrics,
}

/// One-shot transcription of a complete utterance.
#[async_trait]
pub trait BatchAsr: Send + Sync {
    /// Transcribe a WAV blob. An empty transcript is a valid outcome
    /// (silence, noise); callers drop it without surfacing a turn.
    async fn transcribe(&self, wav: &[u8]) -> PipelineResult<AsrReply>;
}

/// OpenAI-compatible `/audio/transcriptions` client (OpenAI Whisper,
/// OpenRouter, Groq, ...).
#[derive(Debug, Clone)]
pub struct OpenAiCompatAsr {
    base_url: String,
    api_key: String,
    model: String,
    language: String,
    client: reqwest::Client,
}

impl OpenAiCompatAsr {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        language: impl Into<String>,
    ) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::Asr(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            language: language.into(),
            client,
        })
    }
}

#[async_trait]
impl BatchAsr for OpenAiCompatAsr {
    async fn transcribe(&self, wav: &[u8]) -> PipelineResult<AsrReply> {
        if wav.is_empty() {
            return Ok(AsrReply {
                transcript: String::new(),
                metrics: StageMetrics::default(),
            });
        }

        let url = format!(
            "{}/audio/transcriptions",
            self.base_url.trim_end_matches('/')
        );
        // "en-US" -> "en"
        let language = self
            .language
            .split('-')
            .next()
            .unwrap_or(&self.language)
            .to_string();

        let part = reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| PipelineError::Asr(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", language);

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PipelineError::Asr(e.to_string()))?;
        let ttfb_ms = started.elapsed().as_secs_f64() * 1000.0;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(provider_error(Stage::Asr, status, body));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Asr(e.to_string()))?;
        let total_ms = started.elapsed().as_secs_f64() * 1000.0;

        let transcript = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        debug!(ttfb_ms, total_ms, "batch transcription complete");

        Ok(AsrReply {
            transcript,
            metrics: StageMetrics::new(ttfb_ms, total_ms),
        })
    }
}

/// Map a provider error body to a tagged pipeline error, rewriting quota
/// exhaustion into something the user can act on.
pub(crate) fn provider_error(
    stage: Stage,
    status: reqwest::StatusCode,
    body: String,
) -> PipelineError {
    if status.as_u16() == 429 || body.to_ascii_lowercase().contains("quota") {
        return PipelineError::Quota {
            stage,
            message: format!(
                "{stage} provider quota exceeded; the session will continue but this stage will \
                 keep failing. Upgrade your plan or use a new API key. ({status})"
            ),
        };
    }
    let message = format!("{status}: {body}");
    match stage {
        Stage::Asr => PipelineError::Asr(message),
        Stage::Llm => PipelineError::Llm(message),
        Stage::Tts => PipelineError::Tts(message),
        Stage::Pipeline => PipelineError::Session(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_wav_short_circuits() {
        let asr = OpenAiCompatAsr::new("https://api.openai.com/v1", "key", "whisper-1", "en-US")
            .unwrap();
        let reply = asr.transcribe(&[]).await.unwrap();
        assert!(reply.transcript.is_empty());
        assert_eq!(reply.metrics.ttfb_ms, 0.0);
    }

    #[test]
    fn quota_body_is_rewritten() {
        let err = provider_error(
            Stage::Tts,
            reqwest::StatusCode::UNAUTHORIZED,
            "character quota exceeded".to_string(),
        );
        assert!(matches!(err, PipelineError::Quota { stage: Stage::Tts, .. }));
        assert!(err.to_string().contains("Upgrade your plan"));
    }

    #[test]
    fn non_quota_error_keeps_stage() {
        let err = provider_error(
            Stage::Asr,
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "boom".to_string(),
        );
        assert!(matches!(err, PipelineError::Asr(_)));
        assert_eq!(err.stage(), Stage::Asr);
    }
}
