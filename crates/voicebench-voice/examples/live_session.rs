//! Live benchmarking session against real vendors.
//!
//! Reads keys from `.env` / the environment:
//! - `DEEPGRAM_API_KEY` — streaming ASR (falls back to OpenAI Whisper +
//!   local VAD when unset)
//! - `OPENAI_API_KEY` — LLM, TTS, and the Whisper fallback
//! - `ELEVENLABS_API_KEY` + `ELEVENLABS_VOICE_ID` — optional TTS override
//!
//! Speak into the default microphone; the session ends after
//! `SESSION_SECONDS` (default 60) or Ctrl+C.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use voicebench_voice::{
    AsrVendor, LlmVendor, SessionCallbacks, SessionConfig, SessionOrchestrator, TtsVendor,
    VadSelection, DEFAULT_SYSTEM_PROMPT,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let openai_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY is required"))?;

    let asr = match std::env::var("DEEPGRAM_API_KEY") {
        Ok(key) => {
            info!("ASR: Deepgram streaming with built-in endpointing");
            AsrVendor::Deepgram {
                api_key: key,
                model: "nova-2".to_string(),
                language: "en-US".to_string(),
            }
        }
        Err(_) => {
            info!("ASR: OpenAI Whisper (batched) behind local VAD");
            AsrVendor::OpenAiCompat {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: openai_key.clone(),
                model: "whisper-1".to_string(),
                language: "en-US".to_string(),
            }
        }
    };

    let tts = match (
        std::env::var("ELEVENLABS_API_KEY"),
        std::env::var("ELEVENLABS_VOICE_ID"),
    ) {
        (Ok(key), Ok(voice_id)) => {
            info!("TTS: ElevenLabs");
            TtsVendor::ElevenLabs {
                api_key: key,
                voice_id,
                model: "eleven_turbo_v2".to_string(),
            }
        }
        _ => {
            info!("TTS: OpenAI");
            TtsVendor::OpenAiCompat {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: openai_key.clone(),
                model: "tts-1".to_string(),
                voice: "alloy".to_string(),
            }
        }
    };

    let max_duration_ms: u64 = std::env::var("SESSION_SECONDS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(60)
        * 1000;

    let config = SessionConfig {
        asr,
        llm: LlmVendor::OpenAiCompat {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: openai_key,
            model: "gpt-4o".to_string(),
        },
        tts,
        max_duration_ms,
        vad: VadSelection::default(),
        system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
    };

    let (end_tx, mut end_rx) = mpsc::unbounded_channel();
    let callbacks = SessionCallbacks {
        on_state_change: Some(Arc::new(|state| info!(?state, "state"))),
        on_interim_transcript: Some(Arc::new(|text| info!("… {text}"))),
        on_transcript: Some(Arc::new(|text, metrics| {
            info!("you: {text} (asr {:.0} ms)", metrics.total_ms);
        })),
        on_response: Some(Arc::new(|text, metrics| {
            info!("assistant: {text} (llm {:.0} ms)", metrics.total_ms);
        })),
        on_turn_complete: Some(Arc::new(|turn| {
            info!(
                "turn {} round trip {:.0} ms",
                turn.id, turn.metrics.round_trip_ms
            );
        })),
        on_time_update: Some(Arc::new(|remaining| {
            if remaining % 10_000 == 0 {
                info!("{} s remaining", remaining / 1000);
            }
        })),
        on_error: Some(Arc::new(|err, stage| info!("[{stage}] error: {err}"))),
        on_session_end: Some(Arc::new(move |summary| {
            let _ = end_tx.send(summary.clone());
        })),
        ..Default::default()
    };

    let mut session = SessionOrchestrator::new(config, callbacks)?;
    session.start().await?;
    info!("listening — speak into the microphone");

    let summary = tokio::select! {
        summary = end_rx.recv() => summary,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping");
            session.stop().await;
            end_rx.recv().await
        }
    };

    if let Some(summary) = summary {
        info!(
            "session over: {} turns, avg round trip {:.0} ms",
            summary.turns.len(),
            summary.average.round_trip_ms
        );
    }

    Ok(())
}
