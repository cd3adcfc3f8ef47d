//! Classifier-backed VAD with hysteresis.
//!
//! Each 30 ms frame is scored by a pretrained speech/non-speech model
//! ([`SpeechModel`]); separate enter/exit thresholds prevent rapid
//! toggling at the boundary. Segments with too few speech frames are
//! reported as misfires and never reach transcription.
//!
//! The shipped classifier wraps WebRTC VAD, which emits hard 0.0/1.0
//! scores; the hysteresis logic only assumes probabilities.

use super::{VadOutput, VadStrategy};
use crate::audio::AudioSegment;
use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Scores audio frames for speech probability.
pub trait SpeechModel {
    /// Probability in 0.0..=1.0 that the frame contains speech.
    fn predict(&mut self, frame: &[f32]) -> PipelineResult<f32>;

    /// Expected samples per frame.
    fn frame_size(&self) -> usize;

    fn sample_rate(&self) -> u32;
}

fn default_positive_threshold() -> f32 {
    0.5
}

fn default_negative_threshold() -> f32 {
    0.35
}

fn default_min_speech_frames() -> usize {
    3
}

fn default_redemption_frames() -> usize {
    8
}

fn default_pre_speech_pad_frames() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuralVadConfig {
    /// Probability at or above which a frame enters speech (default: 0.5).
    #[serde(default = "default_positive_threshold")]
    pub positive_speech_threshold: f32,

    /// Probability below which a frame counts toward ending speech
    /// (default: 0.35). The gap between the two thresholds is the
    /// hysteresis band.
    #[serde(default = "default_negative_threshold")]
    pub negative_speech_threshold: f32,

    /// Minimum speech frames for a valid utterance; fewer is a misfire
    /// (default: 3).
    #[serde(default = "default_min_speech_frames")]
    pub min_speech_frames: usize,

    /// Consecutive sub-negative frames required to end speech
    /// (default: 8, ~250 ms at 30 ms frames).
    #[serde(default = "default_redemption_frames")]
    pub redemption_frames: usize,

    /// Frames of leading audio retained before the detected start
    /// (default: 1).
    #[serde(default = "default_pre_speech_pad_frames")]
    pub pre_speech_pad_frames: usize,
}

impl Default for NeuralVadConfig {
    fn default() -> Self {
        Self {
            positive_speech_threshold: default_positive_threshold(),
            negative_speech_threshold: default_negative_threshold(),
            min_speech_frames: default_min_speech_frames(),
            redemption_frames: default_redemption_frames(),
            pre_speech_pad_frames: default_pre_speech_pad_frames(),
        }
    }
}

pub struct NeuralVad {
    config: NeuralVadConfig,
    model: Box<dyn SpeechModel>,
    speaking: bool,
    speech_frames: usize,
    redemption: usize,
    buffer: Vec<f32>,
    pad: VecDeque<Vec<f32>>,
}

impl NeuralVad {
    pub fn new(config: NeuralVadConfig, model: Box<dyn SpeechModel>) -> Self {
        Self {
            config,
            model,
            speaking: false,
            speech_frames: 0,
            redemption: 0,
            buffer: Vec::new(),
            pad: VecDeque::new(),
        }
    }

    fn finish_segment(&mut self) -> VadOutput {
        self.speaking = false;
        self.redemption = 0;

        if self.speech_frames < self.config.min_speech_frames {
            debug!(
                speech_frames = self.speech_frames,
                "segment rejected as misfire"
            );
            self.speech_frames = 0;
            self.buffer.clear();
            return VadOutput::Misfire;
        }

        let sample_rate = self.model.sample_rate();
        let frame_size = self.model.frame_size();
        let duration_samples = self.speech_frames * frame_size;
        self.speech_frames = 0;

        let segment = AudioSegment {
            samples: std::mem::take(&mut self.buffer),
            sample_rate,
            duration: Duration::from_millis(
                duration_samples as u64 * 1000 / u64::from(sample_rate),
            ),
        };
        debug!(samples = segment.samples.len(), "speech ended");
        VadOutput::SpeechEnd(segment)
    }
}

impl VadStrategy for NeuralVad {
    fn push_frame(&mut self, frame: &[f32]) -> Option<VadOutput> {
        let probability = match self.model.predict(frame) {
            Ok(p) => p,
            Err(e) => {
                warn!("speech model error, frame skipped: {e}");
                return None;
            }
        };

        if !self.speaking {
            if probability >= self.config.positive_speech_threshold {
                self.speaking = true;
                self.speech_frames = 1;
                self.redemption = 0;
                self.buffer.clear();
                for padded in self.pad.drain(..) {
                    self.buffer.extend_from_slice(&padded);
                }
                self.buffer.extend_from_slice(frame);
                debug!("speech started");
                return Some(VadOutput::SpeechStart);
            }

            self.pad.push_back(frame.to_vec());
            while self.pad.len() > self.config.pre_speech_pad_frames {
                self.pad.pop_front();
            }
            return None;
        }

        self.buffer.extend_from_slice(frame);

        if probability >= self.config.positive_speech_threshold {
            self.speech_frames += 1;
            self.redemption = 0;
        } else if probability < self.config.negative_speech_threshold {
            self.redemption += 1;
            if self.redemption >= self.config.redemption_frames {
                return Some(self.finish_segment());
            }
        } else {
            // Inside the hysteresis band: neither speech nor silence.
            self.redemption = 0;
        }

        None
    }

    fn reset(&mut self) {
        self.speaking = false;
        self.speech_frames = 0;
        self.redemption = 0;
        self.buffer.clear();
        self.pad.clear();
    }

    fn frame_size(&self) -> usize {
        self.model.frame_size()
    }

    fn sample_rate(&self) -> u32 {
        self.model.sample_rate()
    }
}

/// WebRTC VAD as a [`SpeechModel`]. Supports 8/16/32/48 kHz and 10/20/30 ms
/// frames; scores are 0.0 or 1.0.
pub struct WebRtcSpeechModel {
    vad: Vad,
    sample_rate: u32,
    frame_size: usize,
}

impl WebRtcSpeechModel {
    /// `mode` is the WebRTC aggressiveness, 0-3.
    pub fn new(sample_rate: u32, mode: u8) -> PipelineResult<Self> {
        let rate = match sample_rate {
            8000 => SampleRate::Rate8kHz,
            16_000 => SampleRate::Rate16kHz,
            32_000 => SampleRate::Rate32kHz,
            48_000 => SampleRate::Rate48kHz,
            other => {
                return Err(PipelineError::Vad(format!(
                    "WebRTC VAD supports 8000, 16000, 32000, or 48000 Hz, got {other}"
                )))
            }
        };
        let vad_mode = match mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => {
                return Err(PipelineError::Vad(format!(
                    "VAD mode must be 0-3, got {other}"
                )))
            }
        };

        let mut vad = Vad::new();
        vad.set_mode(vad_mode);
        vad.set_sample_rate(rate);

        // 30 ms frames.
        let frame_size = (sample_rate as usize) * 30 / 1000;

        Ok(Self {
            vad,
            sample_rate,
            frame_size,
        })
    }
}

impl SpeechModel for WebRtcSpeechModel {
    fn predict(&mut self, frame: &[f32]) -> PipelineResult<f32> {
        if frame.len() != self.frame_size {
            return Err(PipelineError::Vad(format!(
                "expected {} samples, got {}",
                self.frame_size,
                frame.len()
            )));
        }

        let frame_i16 = crate::audio::f32_to_i16(frame);
        let is_speech = self
            .vad
            .is_voice_segment(&frame_i16)
            .map_err(|e| PipelineError::Vad(format!("classification failed: {e:?}")))?;

        Ok(if is_speech { 1.0 } else { 0.0 })
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
