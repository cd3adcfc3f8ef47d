//! Duplex streaming ASR over a persistent WebSocket.
//!
//! Deepgram-style live transcription: microphone frames go up as raw
//! 16-bit LE PCM, interim/final transcript JSON comes back, and the
//! vendor's endpoint detection decides when an utterance is complete. A
//! keep-alive message every 5 s prevents idle teardown.
//!
//! Transcript reassembly lives in [`TranscriptAssembler`] so the
//! accumulate/finalize rules are testable without a network.

use crate::audio::{pcm16_bytes, AudioCapture, AudioConfig, AudioFrame};
use crate::capture::{CaptureEvent, CaptureStrategy};
use crate::error::{PipelineError, PipelineResult, Stage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use voicebench_shared::StageMetrics;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Parameters for the duplex channel.
#[derive(Debug, Clone)]
pub struct StreamingAsrConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub language: String,
    /// Silence that triggers the vendor's speech-final flag (default 300 ms).
    pub endpointing_ms: u64,
    /// Backup utterance-end detection (default 1000 ms).
    pub utterance_end_ms: u64,
    pub sample_rate: u32,
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
}

impl StreamingAsrConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            base_url: "wss://api.deepgram.com/v1/listen".to_string(),
            api_key: api_key.into(),
            model: model.into(),
            language: language.into(),
            endpointing_ms: 300,
            utterance_end_ms: 1000,
            sample_rate: 16_000,
            keepalive_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }

    fn request_url(&self) -> String {
        format!(
            "{}?model={}&language={}&endpointing={}&utterance_end_ms={}&interim_results=true&vad_events=true&smart_format=true&encoding=linear16&sample_rate={}&channels=1",
            self.base_url,
            self.model,
            self.language,
            self.endpointing_ms,
            self.utterance_end_ms,
            self.sample_rate,
        )
    }
}

/// What one incoming transcript message produced.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AsrStreamEvent {
    /// Live view of the utterance so far.
    Interim(String),
    /// A complete utterance; the buffer has been cleared.
    Finalized(String),
}

/// Reassembles utterances from interleaved interim/final/utterance-end
/// messages.
///
/// Rules: `is_final` appends the segment to the accumulated buffer;
/// `speech_final` or an `UtteranceEnd` message finalizes the buffer.
/// Because finalization clears the buffer, whichever endpoint signal
/// arrives first wins and the duplicate is a no-op — a bare transcript
/// final never finalizes on its own.
#[derive(Debug, Default)]
pub(crate) struct TranscriptAssembler {
    utterance: String,
}

impl TranscriptAssembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn ingest(&mut self, raw: &str) -> Vec<AsrStreamEvent> {
        let message: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!("unparseable transcript message, ignored: {e}");
                return Vec::new();
            }
        };

        let mut out = Vec::new();

        if message.get("type").and_then(|t| t.as_str()) == Some("UtteranceEnd") {
            if let Some(complete) = self.take_utterance() {
                out.push(AsrStreamEvent::Finalized(complete));
            }
            return out;
        }

        let transcript = message
            .pointer("/channel/alternatives/0/transcript")
            .and_then(|t| t.as_str())
            .unwrap_or("");
        if transcript.is_empty() {
            return out;
        }

        let is_final = message
            .get("is_final")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let speech_final = message
            .get("speech_final")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if is_final {
            if !self.utterance.is_empty() {
                self.utterance.push(' ');
            }
            self.utterance.push_str(transcript);
            out.push(AsrStreamEvent::Interim(self.utterance.clone()));
        } else {
            let mut live = self.utterance.clone();
            if !live.is_empty() {
                live.push(' ');
            }
            live.push_str(transcript);
            out.push(AsrStreamEvent::Interim(live));
        }

        if speech_final {
            if let Some(complete) = self.take_utterance() {
                out.push(AsrStreamEvent::Finalized(complete));
            }
        }

        out
    }

    fn take_utterance(&mut self) -> Option<String> {
        let trimmed = self.utterance.trim().to_string();
        self.utterance.clear();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

/// Duplex streaming capture. Owns the WebSocket, the microphone, and the
/// keep-alive; emits `Interim` and `Utterance` events.
pub struct DuplexCapture {
    config: StreamingAsrConfig,
    audio: AudioConfig,
    /// When the session last (re)entered listening; duplex ASR metrics
    /// measure from here to finalization.
    listen_since: Arc<Mutex<Instant>>,
    mic_stop: Option<std::sync::mpsc::Sender<()>>,
    close_tx: Option<mpsc::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl DuplexCapture {
    pub fn new(config: StreamingAsrConfig, audio: AudioConfig) -> Self {
        Self {
            config,
            audio,
            listen_since: Arc::new(Mutex::new(Instant::now())),
            mic_stop: None,
            close_tx: None,
            tasks: Vec::new(),
            started: false,
        }
    }
}

#[async_trait]
impl CaptureStrategy for DuplexCapture {
    async fn start(&mut self, events: mpsc::Sender<CaptureEvent>) -> PipelineResult<()> {
        if self.started {
            return Err(PipelineError::Session("capture already started".to_string()));
        }
        self.started = true;

        let mut request = self
            .config
            .request_url()
            .into_client_request()
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.config.api_key))
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let connect_timeout = self.config.connect_timeout;
        let (ws, _response) = timeout(connect_timeout, connect_async(request))
            .await
            .map_err(|_| PipelineError::ConnectTimeout {
                stage: Stage::Asr,
                after: connect_timeout,
            })??;
        info!(model = %self.config.model, "duplex ASR channel open");

        let (mut ws_write, mut ws_read) = ws.split();
        *lock(&self.listen_since) = Instant::now();

        // Microphone: frames flow straight into the writer task, one frame
        // of buffering and no more. The cpal stream itself lives on a
        // holder thread because it is not Send.
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<AudioFrame>();
        let (mic_stop_tx, mic_stop_rx) = std::sync::mpsc::channel::<()>();
        let (mic_ready_tx, mic_ready_rx) = tokio::sync::oneshot::channel();
        let audio_config = self.audio.clone();

        std::thread::spawn(move || {
            let built = AudioCapture::new(audio_config).and_then(|capture| {
                capture.start(move |frame| {
                    let _ = frame_tx.send(frame);
                })
            });
            match built {
                Ok(stream) => {
                    let _ = mic_ready_tx.send(Ok(()));
                    let _ = mic_stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = mic_ready_tx.send(Err(e));
                }
            }
        });

        mic_ready_rx
            .await
            .map_err(|_| PipelineError::Channel("microphone thread died".to_string()))??;
        self.mic_stop = Some(mic_stop_tx);

        // Writer: audio frames, keep-alives, and the closing handshake.
        let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
        self.close_tx = Some(close_tx);
        let keepalive_interval = self.config.keepalive_interval;

        let writer = tokio::spawn(async move {
            let mut keepalive = interval(keepalive_interval);
            keepalive.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    frame = frame_rx.recv() => match frame {
                        Some(frame) => {
                            let payload = pcm16_bytes(&frame.samples);
                            if ws_write.send(WsMessage::Binary(payload)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = keepalive.tick() => {
                        if ws_write
                            .send(WsMessage::Text(r#"{"type":"KeepAlive"}"#.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    _ = close_rx.recv() => {
                        // Explicit termination signal before the transport
                        // close, so in-flight finalization isn't cut off.
                        let _ = ws_write
                            .send(WsMessage::Text(r#"{"type":"CloseStream"}"#.to_string()))
                            .await;
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
        });

        // Reader: reassemble transcripts and surface capture events.
        let listen_since = Arc::clone(&self.listen_since);
        let reader = tokio::spawn(async move {
            let mut assembler = TranscriptAssembler::new();
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        for event in assembler.ingest(&text) {
                            let mapped = match event {
                                AsrStreamEvent::Interim(live) => CaptureEvent::Interim(live),
                                AsrStreamEvent::Finalized(transcript) => {
                                    let elapsed_ms =
                                        lock(&listen_since).elapsed().as_secs_f64() * 1000.0;
                                    debug!(elapsed_ms, "utterance finalized");
                                    CaptureEvent::Utterance {
                                        transcript,
                                        metrics: StageMetrics::new(elapsed_ms, elapsed_ms),
                                    }
                                }
                            };
                            if events.send(mapped).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) => {
                        let _ = events.send(CaptureEvent::Closed).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events
                            .send(CaptureEvent::Error(PipelineError::Transport(e.to_string())))
                            .await;
                        return;
                    }
                }
            }
            let _ = events.send(CaptureEvent::Closed).await;
        });

        self.tasks = vec![writer, reader];
        Ok(())
    }

    fn pause(&self) {
        // The vendor keeps streaming during turn processing; the
        // orchestrator drops finalized utterances while a turn is in
        // flight instead.
    }

    fn resume(&self) {
        *lock(&self.listen_since) = Instant::now();
    }

    async fn shutdown(&mut self) {
        // Release the microphone first, then terminate the channel.
        if let Some(stop) = self.mic_stop.take() {
            let _ = stop.send(());
        }
        if let Some(close) = self.close_tx.take() {
            let _ = close.send(()).await;
        }
        for task in self.tasks.drain(..) {
            if timeout(Duration::from_secs(2), task).await.is_err() {
                warn!("streaming ASR task did not settle before teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results_message(transcript: &str, is_final: bool, speech_final: bool) -> String {
        serde_json::json!({
            "type": "Results",
            "is_final": is_final,
            "speech_final": speech_final,
            "channel": { "alternatives": [{ "transcript": transcript, "confidence": 0.99 }] },
        })
        .to_string()
    }

    #[test]
    fn interim_results_do_not_finalize() {
        let mut assembler = TranscriptAssembler::new();
        let events = assembler.ingest(&results_message("hello", false, false));
        assert_eq!(events, vec![AsrStreamEvent::Interim("hello".to_string())]);

        let events = assembler.ingest(&results_message("hello there", false, false));
        assert_eq!(
            events,
            vec![AsrStreamEvent::Interim("hello there".to_string())]
        );
    }

    #[test]
    fn final_segments_accumulate_until_utterance_end() {
        let mut assembler = TranscriptAssembler::new();
        assembler.ingest(&results_message("hello", true, false));
        assembler.ingest(&results_message("there", true, false));

        let events = assembler.ingest(r#"{"type":"UtteranceEnd"}"#);
        assert_eq!(
            events,
            vec![AsrStreamEvent::Finalized("hello there".to_string())]
        );
    }

    #[test]
    fn speech_final_finalizes_immediately() {
        let mut assembler = TranscriptAssembler::new();
        let events = assembler.ingest(&results_message("hello there", true, true));
        assert_eq!(
            events,
            vec![
                AsrStreamEvent::Interim("hello there".to_string()),
                AsrStreamEvent::Finalized("hello there".to_string()),
            ]
        );
    }

    #[test]
    fn utterance_end_after_speech_final_is_a_no_op() {
        // Both endpoint signals for the same segment: the second must not
        // produce a duplicate (empty-buffer finalize is dropped).
        let mut assembler = TranscriptAssembler::new();
        assembler.ingest(&results_message("hi", true, true));
        let events = assembler.ingest(r#"{"type":"UtteranceEnd"}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn utterance_end_without_content_is_dropped() {
        let mut assembler = TranscriptAssembler::new();
        let events = assembler.ingest(r#"{"type":"UtteranceEnd"}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn garbage_messages_are_ignored() {
        let mut assembler = TranscriptAssembler::new();
        assert!(assembler.ingest("not json").is_empty());
        assert!(assembler.ingest(r#"{"type":"Metadata"}"#).is_empty());
    }

    #[test]
    fn request_url_carries_audio_parameters() {
        let config = StreamingAsrConfig::new("key", "nova-2", "en-US");
        let url = config.request_url();
        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?"));
        assert!(url.contains("encoding=linear16"));
        assert!(url.contains("sample_rate=16000"));
        assert!(url.contains("channels=1"));
        assert!(url.contains("endpointing=300"));
        assert!(url.contains("utterance_end_ms=1000"));
        assert!(url.contains("interim_results=true"));
    }
}
