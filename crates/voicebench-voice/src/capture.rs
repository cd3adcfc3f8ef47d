//! Capture strategies: how a session acquires finalized user utterances.
//!
//! Exactly one strategy owns the microphone at a time. The duplex path
//! (`asr::streaming`) emits finalized transcripts directly; the local-VAD
//! path here emits raw speech segments for batch transcription. The
//! orchestrator consumes both through the same [`CaptureStrategy`] trait
//! and the closed [`CaptureEvent`] set.

use crate::audio::{AudioCapture, AudioConfig, AudioFrame, AudioSegment};
use crate::error::{PipelineError, PipelineResult};
use crate::vad::{VadOutput, VadStrategy};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Everything a capture strategy can report to the orchestrator.
#[derive(Debug)]
pub enum CaptureEvent {
    /// Live interim transcript (duplex path only). Not finalized.
    Interim(String),
    /// A finalized utterance with its ASR timing (duplex path).
    Utterance {
        transcript: String,
        metrics: voicebench_shared::StageMetrics,
    },
    /// A VAD-delimited speech segment awaiting batch transcription.
    Segment(AudioSegment),
    /// The VAD rejected a segment as too short. Informational only.
    Misfire,
    /// A capture-side failure.
    Error(PipelineError),
    /// The capture source shut down.
    Closed,
}

/// One interface over both capture paths. The orchestrator never branches
/// on vendor id beyond the single selection point in `start()`.
#[async_trait]
pub trait CaptureStrategy: Send {
    /// Acquire the microphone and begin emitting events. Consumes the
    /// strategy's one startup; fails if already started.
    async fn start(&mut self, events: mpsc::Sender<CaptureEvent>) -> PipelineResult<()>;

    /// Discard captured audio until `resume`. Used while a turn is being
    /// processed.
    fn pause(&self);

    fn resume(&self);

    /// Release the microphone and stop emitting events.
    async fn shutdown(&mut self);
}

/// Builds a VAD strategy inside the capture thread; webrtc-vad is not
/// `Send`, so construction cannot happen on the caller's side.
pub type VadFactory = Box<dyn FnOnce() -> PipelineResult<Box<dyn VadStrategy>> + Send>;

/// Local-VAD capture: cpal frames are pushed through a [`VadStrategy`] on
/// a dedicated thread; committed segments surface as
/// [`CaptureEvent::Segment`].
pub struct VadCapture {
    audio: AudioConfig,
    factory: Option<VadFactory>,
    paused: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
}

impl VadCapture {
    pub fn new(audio: AudioConfig, factory: VadFactory) -> Self {
        Self {
            audio,
            factory: Some(factory),
            paused: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl CaptureStrategy for VadCapture {
    async fn start(&mut self, events: mpsc::Sender<CaptureEvent>) -> PipelineResult<()> {
        let factory = self
            .factory
            .take()
            .ok_or_else(|| PipelineError::Session("capture already started".to_string()))?;

        let audio = self.audio.clone();
        let paused = Arc::clone(&self.paused);
        let stopping = Arc::clone(&self.stopping);
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

        std::thread::spawn(move || {
            // VAD and cpal stream both live and die on this thread.
            let mut strategy = match factory() {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let (frame_tx, frame_rx) = std::sync::mpsc::channel::<AudioFrame>();
            let stream = match AudioCapture::new(audio)
                .and_then(|capture| capture.start(move |frame| {
                    let _ = frame_tx.send(frame);
                })) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let _ = ready_tx.send(Ok(()));
            info!("VAD capture thread started");

            loop {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                let frame = match frame_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(frame) => frame,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };

                if paused.load(Ordering::SeqCst) {
                    // Audio captured during turn processing is discarded,
                    // and any half-built utterance with it.
                    strategy.reset();
                    continue;
                }

                match strategy.push_frame(&frame.samples) {
                    Some(VadOutput::SpeechStart) => debug!("speech start"),
                    Some(VadOutput::SpeechEnd(segment)) => {
                        if events.blocking_send(CaptureEvent::Segment(segment)).is_err() {
                            break;
                        }
                    }
                    Some(VadOutput::Misfire) => {
                        if events.blocking_send(CaptureEvent::Misfire).is_err() {
                            break;
                        }
                    }
                    None => {}
                }
            }

            // Dropping the stream releases the microphone.
            drop(stream);
            let _ = events.blocking_send(CaptureEvent::Closed);
            info!("VAD capture thread stopped");
        });

        ready_rx
            .await
            .map_err(|_| PipelineError::Channel("capture thread died during startup".to_string()))?
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    async fn shutdown(&mut self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        // The thread notices within its 100 ms receive timeout; nothing to
        // join on — the mic is released when the thread drops the stream.
    }
}

impl Drop for VadCapture {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_flag_round_trips() {
        let capture = VadCapture::new(
            AudioConfig::default(),
            Box::new(|| {
                Err(PipelineError::Vad("not built in tests".to_string()))
            }),
        );
        assert!(!capture.paused.load(Ordering::SeqCst));
        capture.pause();
        assert!(capture.paused.load(Ordering::SeqCst));
        capture.resume();
        assert!(!capture.paused.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let mut capture = VadCapture::new(
            AudioConfig::default(),
            Box::new(|| Err(PipelineError::Vad("no model".to_string()))),
        );
        let (tx, _rx) = mpsc::channel(4);
        // First start fails in the factory (no model on test hosts)...
        assert!(capture.start(tx.clone()).await.is_err());
        // ...and the startup token is spent either way.
        let err = capture.start(tx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Session(_)));
    }

}
