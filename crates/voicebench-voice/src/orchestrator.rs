//! The turn orchestrator: one session's state machine.
//!
//! Sequences ASR → LLM → TTS → playback per turn, tracks per-stage and
//! round-trip timing, enforces the session deadline, and keeps every
//! failure inside the callback boundary. Exactly one turn is ever in
//! flight; utterances finalized while a turn is processing are dropped,
//! not queued.

use crate::asr::{BatchAsr, DuplexCapture, OpenAiCompatAsr, StreamingAsrConfig};
use crate::audio::{AudioConfig, AudioSegment, AudioSink, RodioSink};
use crate::capture::{CaptureEvent, CaptureStrategy, VadCapture, VadFactory};
use crate::config::{AsrVendor, LlmVendor, SessionConfig, TtsVendor, VadSelection};
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::llm::{AnthropicChat, ChatMessage, ChatModel, OpenAiCompatChat};
use crate::tts::{ElevenLabsTts, OpenAiCompatTts, SpeechSynth};
use crate::vad::{EnergyVad, NeuralVad, VadStrategy, WebRtcSpeechModel};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info};
use voicebench_shared::{
    summarize, EventKind, EventLogger, SessionEndReason, SessionSummary, StageMetrics, Turn,
    TurnMetrics,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Session lifecycle state. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Listening,
    Processing,
    Speaking,
    Error,
}

/// Fire-and-forget notifications to the caller. No return value is ever
/// consumed.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    pub on_state_change: Option<Arc<dyn Fn(SessionState) + Send + Sync>>,
    pub on_turn_start: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_interim_transcript: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_transcript: Option<Arc<dyn Fn(&str, &StageMetrics) + Send + Sync>>,
    pub on_response: Option<Arc<dyn Fn(&str, &StageMetrics) + Send + Sync>>,
    pub on_audio_start: Option<Arc<dyn Fn(&StageMetrics) + Send + Sync>>,
    pub on_turn_complete: Option<Arc<dyn Fn(&Turn) + Send + Sync>>,
    pub on_time_update: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    pub on_session_end: Option<Arc<dyn Fn(&SessionSummary) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&PipelineError, Stage) + Send + Sync>>,
}

/// Pre-built pipeline components. `start()` assembles these from the
/// vendor config; tests inject their own.
pub struct PipelineParts {
    pub capture: Box<dyn CaptureStrategy>,
    /// Required for the local-VAD path; unused on the duplex path.
    pub batch_asr: Option<Arc<dyn BatchAsr>>,
    pub chat: Arc<dyn ChatModel>,
    pub synth: Arc<dyn SpeechSynth>,
    pub sink: Arc<dyn AudioSink>,
}

struct Shared {
    session_id: String,
    config: SessionConfig,
    callbacks: SessionCallbacks,
    logger: EventLogger,
    state: Mutex<SessionState>,
    turns: Mutex<Vec<Turn>>,
    history: Mutex<Vec<ChatMessage>>,
    turn_counter: AtomicU64,
    /// Single-flight guard: set for the whole of one turn's processing.
    processing: AtomicBool,
    /// Once set, no further shared mutation is allowed; in-flight results
    /// are discarded.
    stopped: AtomicBool,
    /// Session-end emission guard (exactly once).
    ended: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    capture: tokio::sync::Mutex<Option<Box<dyn CaptureStrategy>>>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
        if let Some(cb) = &self.callbacks.on_state_change {
            cb(state);
        }
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn elapsed(&self) -> Duration {
        match *lock(&self.started_at) {
            Some(started) => started.elapsed(),
            None => Duration::ZERO,
        }
    }

    /// Surface a stage-tagged error and move the session to `Error`. The
    /// turn loop halts; recovery is a caller-level `start()`.
    fn fail(&self, err: &PipelineError) {
        let stage = err.stage();
        error!(%stage, "pipeline error: {err}");
        self.logger.log(EventKind::Error {
            message: err.to_string(),
            code: None,
        });
        if let Some(cb) = &self.callbacks.on_error {
            cb(err, stage);
        }
        self.set_state(SessionState::Error);
    }

    /// Tear the session down. Idempotent; emits the session summary
    /// exactly once and always leaves the state machine in `Idle`.
    async fn finish(self: &Arc<Self>, reason: SessionEndReason) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);
        info!(?reason, "session ending");

        if let Some(mut capture) = self.capture.lock().await.take() {
            capture.shutdown().await;
        }

        let duration = self.elapsed();
        self.logger.log(EventKind::SessionEnd {
            reason,
            duration_ms: duration.as_millis() as u64,
        });

        let turns = lock(&self.turns).clone();
        let summary = summarize(turns, duration);
        if let Some(cb) = &self.callbacks.on_session_end {
            cb(&summary);
        }

        self.set_state(SessionState::Idle);
    }
}

/// Owns one voice session from `start()` to `stop()`.
pub struct SessionOrchestrator {
    shared: Arc<Shared>,
    loop_task: Option<JoinHandle<()>>,
    ticker_task: Option<JoinHandle<()>>,
}

impl SessionOrchestrator {
    /// Validates the configuration up front; a missing vendor field fails
    /// here, not mid-handshake.
    pub fn new(config: SessionConfig, callbacks: SessionCallbacks) -> PipelineResult<Self> {
        config.validate()?;

        let session_id = format!("session-{}", Utc::now().timestamp_millis());
        info!(%session_id, "orchestrator created");

        Ok(Self {
            shared: Arc::new(Shared {
                logger: EventLogger::new(session_id.clone()),
                session_id,
                config,
                callbacks,
                state: Mutex::new(SessionState::Idle),
                turns: Mutex::new(Vec::new()),
                history: Mutex::new(Vec::new()),
                turn_counter: AtomicU64::new(0),
                processing: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                started_at: Mutex::new(None),
                capture: tokio::sync::Mutex::new(None),
            }),
            loop_task: None,
            ticker_task: None,
        })
    }

    /// Build the pipeline from the vendor config and begin the session.
    /// This is the only place vendor ids are branched on.
    pub async fn start(&mut self) -> PipelineResult<()> {
        let parts = build_pipeline(&self.shared.config)?;
        self.start_with(parts).await
    }

    /// Begin the session with pre-built components.
    pub async fn start_with(&mut self, parts: PipelineParts) -> PipelineResult<()> {
        if self.loop_task.is_some() {
            return Err(PipelineError::Session("session already started".to_string()));
        }

        let shared = Arc::clone(&self.shared);
        *lock(&shared.started_at) = Some(Instant::now());
        shared.logger.log(EventKind::SessionStart {
            system_prompt: shared.config.system_prompt.clone(),
            llm_model: shared.config.llm.model().to_string(),
            tts_voice: shared.config.tts.voice().to_string(),
        });
        shared.set_state(SessionState::Listening);

        self.ticker_task = Some(tokio::spawn(deadline_loop(Arc::clone(&shared))));

        let PipelineParts {
            mut capture,
            batch_asr,
            chat,
            synth,
            sink,
        } = parts;

        let (event_tx, event_rx) = mpsc::channel(64);
        if let Err(err) = capture.start(event_tx).await {
            shared.fail(&err);
            return Err(err);
        }
        *shared.capture.lock().await = Some(capture);

        if let Some(cb) = &shared.callbacks.on_turn_start {
            cb();
        }

        self.loop_task = Some(tokio::spawn(event_loop(
            shared, event_rx, batch_asr, chat, synth, sink,
        )));
        Ok(())
    }

    /// End the session. Idempotent and safe from any state, including
    /// mid-turn: an in-flight turn's results are discarded, not appended.
    pub async fn stop(&self) {
        self.shared.finish(SessionEndReason::UserRequested).await;
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Snapshot of the turns appended so far.
    pub fn turns(&self) -> Vec<Turn> {
        lock(&self.shared.turns).clone()
    }

    /// Snapshot of the conversation history (user/assistant messages).
    pub fn conversation_history(&self) -> Vec<ChatMessage> {
        lock(&self.shared.history).clone()
    }

    /// Events recorded so far (append-only).
    pub fn events(&self) -> Vec<voicebench_shared::Event> {
        self.shared.logger.events()
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.ticker_task.take() {
            task.abort();
        }
        if let Some(task) = self.loop_task.take() {
            task.abort();
        }
    }
}

/// Reports time remaining every 100 ms and stops the session at the
/// deadline. Runs independently of turn processing so the countdown keeps
/// flowing during LLM/TTS waits.
async fn deadline_loop(shared: Arc<Shared>) {
    let max_duration = shared.config.max_duration();
    let mut ticker = interval(Duration::from_millis(100));
    ticker.tick().await; // the immediate first tick

    loop {
        ticker.tick().await;
        if shared.ended.load(Ordering::SeqCst) {
            break;
        }

        let remaining = max_duration.saturating_sub(shared.elapsed());
        if let Some(cb) = &shared.callbacks.on_time_update {
            cb(remaining.as_millis() as u64);
        }

        if remaining.is_zero() {
            shared.finish(SessionEndReason::Timeout).await;
            break;
        }
    }
}

/// Multiplexes capture events onto the session state machine.
async fn event_loop(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<CaptureEvent>,
    batch_asr: Option<Arc<dyn BatchAsr>>,
    chat: Arc<dyn ChatModel>,
    synth: Arc<dyn SpeechSynth>,
    sink: Arc<dyn AudioSink>,
) {
    while let Some(event) = events.recv().await {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }

        match event {
            CaptureEvent::Interim(text) => {
                if !shared.processing.load(Ordering::SeqCst) {
                    shared.logger.log(EventKind::AsrPartial { text: text.clone() });
                    if let Some(cb) = &shared.callbacks.on_interim_transcript {
                        cb(&text);
                    }
                }
            }

            CaptureEvent::Utterance {
                transcript,
                metrics,
            } => {
                if transcript.trim().is_empty() {
                    continue;
                }
                // Single-flight: drop, never queue.
                if shared.processing.swap(true, Ordering::SeqCst) {
                    debug!("utterance dropped, turn already in flight");
                    continue;
                }
                shared.set_state(SessionState::Processing);
                spawn_turn(
                    Arc::clone(&shared),
                    transcript,
                    metrics,
                    Arc::clone(&chat),
                    Arc::clone(&synth),
                    Arc::clone(&sink),
                );
            }

            CaptureEvent::Segment(segment) => {
                if shared.processing.swap(true, Ordering::SeqCst) {
                    debug!("speech segment dropped, turn already in flight");
                    continue;
                }
                shared.set_state(SessionState::Processing);
                pause_capture(&shared).await;

                let Some(asr) = batch_asr.clone() else {
                    // Fatal: the pipeline cannot make progress. Release
                    // resources and emit the one session end.
                    shared.processing.store(false, Ordering::SeqCst);
                    shared.fail(&PipelineError::Config(
                        "no batch ASR client for the local-VAD capture path".to_string(),
                    ));
                    shared.finish(SessionEndReason::Error).await;
                    break;
                };

                let shared_task = Arc::clone(&shared);
                let chat = Arc::clone(&chat);
                let synth = Arc::clone(&synth);
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    match transcribe_segment(&shared_task, &segment, asr.as_ref()).await {
                        Ok(Some((transcript, metrics))) => {
                            run_turn(&shared_task, transcript, metrics, chat, synth, sink).await;
                        }
                        Ok(None) => {
                            debug!("empty transcript, resuming without a turn");
                        }
                        Err(err) => {
                            shared_task.fail(&err);
                        }
                    }
                    // Resume before clearing the single-flight guard so a
                    // fast next utterance can't observe a stale state.
                    resume_listening(&shared_task).await;
                    shared_task.processing.store(false, Ordering::SeqCst);
                });
            }

            CaptureEvent::Misfire => {
                debug!("VAD misfire ignored");
            }

            CaptureEvent::Error(err) => {
                shared.fail(&err);
                break;
            }

            CaptureEvent::Closed => {
                if !shared.stopped.load(Ordering::SeqCst) {
                    debug!("capture source closed");
                }
                break;
            }
        }
    }
}

fn spawn_turn(
    shared: Arc<Shared>,
    transcript: String,
    metrics: StageMetrics,
    chat: Arc<dyn ChatModel>,
    synth: Arc<dyn SpeechSynth>,
    sink: Arc<dyn AudioSink>,
) {
    tokio::spawn(async move {
        run_turn(&shared, transcript, metrics, chat, synth, sink).await;
        // Resume before clearing the single-flight guard so a fast next
        // utterance can't observe a stale state.
        resume_listening(&shared).await;
        shared.processing.store(false, Ordering::SeqCst);
    });
}

async fn pause_capture(shared: &Arc<Shared>) {
    if let Some(capture) = shared.capture.lock().await.as_ref() {
        capture.pause();
    }
}

/// Return to `Listening` and hand the microphone back to the capture
/// strategy — unless the session has since stopped or errored.
async fn resume_listening(shared: &Arc<Shared>) {
    if shared.stopped.load(Ordering::SeqCst) || shared.state() == SessionState::Error {
        return;
    }
    if let Some(capture) = shared.capture.lock().await.as_ref() {
        capture.resume();
    }
    shared.set_state(SessionState::Listening);
}

/// Batch-transcribe a VAD segment. `Ok(None)` means an empty transcript,
/// dropped silently.
async fn transcribe_segment(
    shared: &Arc<Shared>,
    segment: &AudioSegment,
    asr: &dyn BatchAsr,
) -> PipelineResult<Option<(String, StageMetrics)>> {
    let wav = segment.to_wav();
    shared
        .logger
        .log(EventKind::AudioChunkReceived { size: wav.len() });

    let reply = asr.transcribe(&wav).await?;
    if reply.transcript.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some((reply.transcript, reply.metrics)))
}

/// One turn: transcript → LLM → TTS → playback → immutable Turn record.
///
/// Note the deliberate asymmetry: the assistant's reply joins the
/// conversation history *before* TTS runs, so a TTS failure leaves the
/// reply in history even though no Turn is appended.
async fn run_turn(
    shared: &Arc<Shared>,
    transcript: String,
    asr_metrics: StageMetrics,
    chat: Arc<dyn ChatModel>,
    synth: Arc<dyn SpeechSynth>,
    sink: Arc<dyn AudioSink>,
) {
    let turn_started = Instant::now();
    let turn_id = shared.turn_counter.fetch_add(1, Ordering::SeqCst) + 1;
    info!(turn_id, %transcript, "turn started");

    shared.logger.log(EventKind::AsrFinal {
        text: transcript.clone(),
        speech_end_ms: Utc::now().timestamp_millis(),
    });
    if let Some(cb) = &shared.callbacks.on_transcript {
        cb(&transcript, &asr_metrics);
    }

    lock(&shared.history).push(ChatMessage::user(transcript.clone()));

    // LLM phase.
    shared.logger.log(EventKind::LlmStart {
        prompt: transcript.clone(),
    });
    let history_snapshot = lock(&shared.history).clone();
    let llm = match chat.generate(&history_snapshot).await {
        Ok(reply) => reply,
        Err(err) => {
            shared.fail(&err);
            return;
        }
    };
    if shared.stopped.load(Ordering::SeqCst) {
        debug!("LLM reply discarded, session stopped");
        return;
    }
    if let Some(cb) = &shared.callbacks.on_response {
        cb(&llm.text, &llm.metrics);
    }

    lock(&shared.history).push(ChatMessage::assistant(llm.text.clone()));
    shared.logger.log(EventKind::LlmComplete {
        full_text: llm.text.clone(),
        tokens_input: llm.usage.input,
        tokens_output: llm.usage.output,
    });

    // TTS phase.
    shared.set_state(SessionState::Speaking);
    shared.logger.log(EventKind::TtsStart {
        text: llm.text.clone(),
        character_count: llm.text.chars().count(),
    });
    let tts = match synth.synthesize(&llm.text).await {
        Ok(audio) => audio,
        Err(err) => {
            shared.fail(&err);
            return;
        }
    };
    if shared.stopped.load(Ordering::SeqCst) {
        debug!("synthesized audio discarded, session stopped");
        return;
    }
    shared.logger.log(EventKind::TtsAudioChunk {
        size: tts.audio.len(),
        is_first: true,
    });
    shared.logger.log(EventKind::TtsComplete {
        total_chunks: tts.chunks,
        total_size: tts.audio.len(),
    });

    // Playback. Round trip is measured once playback has started.
    if let Err(err) = sink.begin(&tts.audio) {
        shared.fail(&err);
        return;
    }
    let round_trip_ms = turn_started.elapsed().as_secs_f64() * 1000.0;
    if let Some(cb) = &shared.callbacks.on_audio_start {
        cb(&tts.metrics);
    }
    sink.drain().await;

    if shared.stopped.load(Ordering::SeqCst) {
        debug!("turn result discarded, session stopped");
        return;
    }

    let turn = Turn {
        id: turn_id,
        user_text: transcript,
        assistant_text: llm.text,
        metrics: TurnMetrics {
            asr: asr_metrics,
            llm: llm.metrics,
            tts: tts.metrics,
            round_trip_ms,
        },
        timestamp: Utc::now(),
    };

    lock(&shared.turns).push(turn.clone());
    info!(turn_id, round_trip_ms, "turn complete");
    if let Some(cb) = &shared.callbacks.on_turn_complete {
        cb(&turn);
    }
}

/// Assemble concrete clients from the vendor config.
fn build_pipeline(config: &SessionConfig) -> PipelineResult<PipelineParts> {
    let mut batch_asr: Option<Arc<dyn BatchAsr>> = None;

    let capture: Box<dyn CaptureStrategy> = match &config.asr {
        AsrVendor::Deepgram {
            api_key,
            model,
            language,
        } => {
            let streaming = StreamingAsrConfig::new(api_key.clone(), model.clone(), language.clone());
            Box::new(DuplexCapture::new(streaming, AudioConfig::default()))
        }
        AsrVendor::OpenAiCompat {
            base_url,
            api_key,
            model,
            language,
        } => {
            batch_asr = Some(Arc::new(OpenAiCompatAsr::new(
                base_url.clone(),
                api_key.clone(),
                model.clone(),
                language.clone(),
            )?));
            let (audio, factory) = vad_capture_parts(&config.vad);
            Box::new(VadCapture::new(audio, factory))
        }
    };

    let chat: Arc<dyn ChatModel> = match &config.llm {
        LlmVendor::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Arc::new(OpenAiCompatChat::new(
            base_url.clone(),
            api_key.clone(),
            model.clone(),
            config.system_prompt.clone(),
        )?),
        LlmVendor::Anthropic {
            base_url,
            api_key,
            model,
        } => Arc::new(AnthropicChat::new(
            base_url.clone(),
            api_key.clone(),
            model.clone(),
            config.system_prompt.clone(),
        )?),
    };

    let synth: Arc<dyn SpeechSynth> = match &config.tts {
        TtsVendor::OpenAiCompat {
            base_url,
            api_key,
            model,
            voice,
        } => Arc::new(OpenAiCompatTts::new(
            base_url.clone(),
            api_key.clone(),
            model.clone(),
            voice.clone(),
        )?),
        TtsVendor::ElevenLabs {
            api_key,
            voice_id,
            model,
        } => Arc::new(ElevenLabsTts::new(
            api_key.clone(),
            voice_id.clone(),
            model.clone(),
        )?),
    };

    let sink: Arc<dyn AudioSink> = Arc::new(RodioSink::new()?);

    Ok(PipelineParts {
        capture,
        batch_asr,
        chat,
        synth,
        sink,
    })
}

/// Capture config and in-thread VAD constructor for the selected strategy.
fn vad_capture_parts(selection: &VadSelection) -> (AudioConfig, VadFactory) {
    match selection {
        VadSelection::Energy(energy) => {
            let audio = AudioConfig {
                sample_rate: energy.sample_rate,
                channels: 1,
                frame_size: energy.window_size,
            };
            let energy = energy.clone();
            let factory: VadFactory = Box::new(move || {
                Ok(Box::new(EnergyVad::new(energy)) as Box<dyn VadStrategy>)
            });
            (audio, factory)
        }
        VadSelection::Neural(neural) => {
            let audio = AudioConfig {
                sample_rate: 16_000,
                channels: 1,
                frame_size: 480, // 30 ms classifier frames
            };
            let neural = neural.clone();
            let factory: VadFactory = Box::new(move || {
                let model = WebRtcSpeechModel::new(16_000, 3)?;
                Ok(Box::new(NeuralVad::new(neural, Box::new(model))) as Box<dyn VadStrategy>)
            });
            (audio, factory)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            asr: AsrVendor::Deepgram {
                api_key: "dg".to_string(),
                model: "nova-2".to_string(),
                language: "en-US".to_string(),
            },
            llm: LlmVendor::OpenAiCompat {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: "oa".to_string(),
                model: "gpt-4o".to_string(),
            },
            tts: TtsVendor::OpenAiCompat {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: "oa".to_string(),
                model: "tts-1".to_string(),
                voice: "alloy".to_string(),
            },
            max_duration_ms: 60_000,
            vad: VadSelection::default(),
            system_prompt: "be brief".to_string(),
        }
    }

    #[test]
    fn new_validates_config() {
        let mut bad = config();
        bad.llm = LlmVendor::OpenAiCompat {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o".to_string(),
        };
        assert!(SessionOrchestrator::new(bad, SessionCallbacks::default()).is_err());
    }

    #[test]
    fn fresh_session_is_idle_with_no_turns() {
        let orchestrator =
            SessionOrchestrator::new(config(), SessionCallbacks::default()).unwrap();
        assert_eq!(orchestrator.state(), SessionState::Idle);
        assert!(orchestrator.turns().is_empty());
        assert!(orchestrator.conversation_history().is_empty());
        assert!(orchestrator.session_id().starts_with("session-"));
    }

    #[test]
    fn session_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(SessionState::Listening).unwrap(),
            "listening"
        );
    }
}
