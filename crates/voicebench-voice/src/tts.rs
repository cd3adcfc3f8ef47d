//! Speech synthesis clients.
//!
//! Responses stream where the vendor supports it: time-to-first-byte is
//! measured at the first audio chunk, and chunks are accumulated into one
//! playable blob.

use crate::asr::provider_error;
use crate::error::{PipelineError, PipelineResult, Stage};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::debug;
use voicebench_shared::StageMetrics;

/// Synthesized audio plus timing.
#[derive(Debug, Clone)]
pub struct TtsAudio {
    /// Complete audio blob (MP3 unless the vendor says otherwise).
    pub audio: Vec<u8>,
    /// How many network chunks the audio arrived in (1 for blob vendors).
    pub chunks: usize,
    pub metrics: StageMetrics,
}

/// Text-to-speech seam.
#[async_trait]
pub trait SpeechSynth: Send + Sync {
    /// Synthesize speech. Empty input yields empty audio without a
    /// network call.
    async fn synthesize(&self, text: &str) -> PipelineResult<TtsAudio>;
}

fn http_client() -> PipelineResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .map_err(|e| PipelineError::Tts(e.to_string()))
}

/// Collect a streaming body, recording the first-chunk time.
async fn collect_stream(
    response: reqwest::Response,
    started: Instant,
) -> PipelineResult<TtsAudio> {
    let mut stream = response.bytes_stream();
    let mut audio = Vec::new();
    let mut chunks = 0usize;
    let mut ttfb_ms = 0.0f64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| PipelineError::Tts(e.to_string()))?;
        if chunks == 0 {
            ttfb_ms = started.elapsed().as_secs_f64() * 1000.0;
        }
        chunks += 1;
        audio.extend_from_slice(&chunk);
    }

    let total_ms = started.elapsed().as_secs_f64() * 1000.0;
    debug!(chunks, bytes = audio.len(), ttfb_ms, total_ms, "synthesis complete");

    Ok(TtsAudio {
        audio,
        chunks,
        metrics: StageMetrics::new(ttfb_ms, total_ms),
    })
}

/// OpenAI-compatible `/audio/speech` client.
#[derive(Debug, Clone)]
pub struct OpenAiCompatTts {
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
    client: reqwest::Client,
}

impl OpenAiCompatTts {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> PipelineResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
            client: http_client()?,
        })
    }
}

#[async_trait]
impl SpeechSynth for OpenAiCompatTts {
    async fn synthesize(&self, text: &str) -> PipelineResult<TtsAudio> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(TtsAudio {
                audio: Vec::new(),
                chunks: 0,
                metrics: StageMetrics::default(),
            });
        }

        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": "mp3",
        });

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Tts(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(provider_error(Stage::Tts, status, body));
        }

        collect_stream(response, started).await
    }
}

/// ElevenLabs `text-to-speech/{voice_id}` client.
#[derive(Debug, Clone)]
pub struct ElevenLabsTts {
    api_key: String,
    voice_id: String,
    model: String,
    client: reqwest::Client,
}

impl ElevenLabsTts {
    pub fn new(
        api_key: impl Into<String>,
        voice_id: impl Into<String>,
        model: impl Into<String>,
    ) -> PipelineResult<Self> {
        Ok(Self {
            api_key: api_key.into(),
            voice_id: voice_id.into(),
            model: model.into(),
            client: http_client()?,
        })
    }
}

#[async_trait]
impl SpeechSynth for ElevenLabsTts {
    async fn synthesize(&self, text: &str) -> PipelineResult<TtsAudio> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(TtsAudio {
                audio: Vec::new(),
                chunks: 0,
                metrics: StageMetrics::default(),
            });
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}",
            self.voice_id
        );
        let body = serde_json::json!({
            "text": text,
            "model_id": self.model,
            "voice_settings": {
                "stability": 0.5,
                "similarity_boost": 0.75,
            },
        });

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Tts(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(provider_error(Stage::Tts, status, body));
        }

        collect_stream(response, started).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_text_skips_the_network() {
        let tts = OpenAiCompatTts::new("https://api.openai.com/v1", "key", "tts-1", "alloy")
            .unwrap();
        let out = tts.synthesize("   ").await.unwrap();
        assert!(out.audio.is_empty());
        assert_eq!(out.chunks, 0);
        assert_eq!(out.metrics.total_ms, 0.0);
    }

    #[tokio::test]
    async fn elevenlabs_empty_text_skips_too() {
        let tts = ElevenLabsTts::new("key", "voice", "eleven_turbo_v2").unwrap();
        let out = tts.synthesize("").await.unwrap();
        assert!(out.audio.is_empty());
    }
}
