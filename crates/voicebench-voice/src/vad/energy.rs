//! Energy-threshold VAD.
//!
//! RMS volume over fixed 512-sample windows. Speech begins when volume
//! exceeds the threshold; it ends once volume stays below the threshold
//! for the configured silence duration. Utterances shorter than the
//! minimum speech duration are dropped silently as noise.

use super::{VadOutput, VadStrategy};
use crate::audio::AudioSegment;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

fn default_sample_rate() -> u32 {
    16_000
}

fn default_window_size() -> usize {
    512
}

fn default_silence_threshold() -> f32 {
    0.05
}

fn default_silence_duration_ms() -> u64 {
    1500
}

fn default_min_speech_duration_ms() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyVadConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Analysis window in samples (default: 512).
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// RMS volume above which a window counts as speech (default: 0.05).
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f32,

    /// How long volume must stay below threshold before the utterance ends
    /// (default: 1500 ms).
    #[serde(default = "default_silence_duration_ms")]
    pub silence_duration_ms: u64,

    /// Utterances shorter than this are discarded as misfires
    /// (default: 300 ms).
    #[serde(default = "default_min_speech_duration_ms")]
    pub min_speech_duration_ms: u64,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            window_size: default_window_size(),
            silence_threshold: default_silence_threshold(),
            silence_duration_ms: default_silence_duration_ms(),
            min_speech_duration_ms: default_min_speech_duration_ms(),
        }
    }
}

/// RMS of one window of samples.
pub fn rms_volume(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f32 = frame.iter().map(|s| s * s).sum();
    (sum / frame.len() as f32).sqrt()
}

pub struct EnergyVad {
    config: EnergyVadConfig,
    speaking: bool,
    /// Samples buffered since speech start, including trailing silence.
    buffer: Vec<f32>,
    /// Consecutive below-threshold samples at the tail of the buffer.
    silence_samples: u64,
}

impl EnergyVad {
    pub fn new(config: EnergyVadConfig) -> Self {
        Self {
            config,
            speaking: false,
            buffer: Vec::new(),
            silence_samples: 0,
        }
    }

    fn ms_to_samples(&self, ms: u64) -> u64 {
        ms * u64::from(self.config.sample_rate) / 1000
    }

    fn samples_to_duration(&self, samples: u64) -> Duration {
        Duration::from_millis(samples * 1000 / u64::from(self.config.sample_rate))
    }
}

impl VadStrategy for EnergyVad {
    fn push_frame(&mut self, frame: &[f32]) -> Option<VadOutput> {
        let volume = rms_volume(frame);
        let loud = volume > self.config.silence_threshold;

        if loud {
            self.silence_samples = 0;
            if !self.speaking {
                self.speaking = true;
                self.buffer.clear();
                self.buffer.extend_from_slice(frame);
                debug!(volume, "speech started");
                return Some(VadOutput::SpeechStart);
            }
            self.buffer.extend_from_slice(frame);
            return None;
        }

        if !self.speaking {
            return None;
        }

        // Silence during an utterance: keep buffering until the gap is
        // long enough to end the turn.
        self.buffer.extend_from_slice(frame);
        self.silence_samples += frame.len() as u64;

        if self.silence_samples < self.ms_to_samples(self.config.silence_duration_ms) {
            return None;
        }

        self.speaking = false;
        let speech_samples = (self.buffer.len() as u64).saturating_sub(self.silence_samples);
        let speech_duration = self.samples_to_duration(speech_samples);
        self.silence_samples = 0;

        if speech_samples < self.ms_to_samples(self.config.min_speech_duration_ms) {
            debug!(?speech_duration, "utterance too short, dropped");
            self.buffer.clear();
            return None;
        }

        let segment = AudioSegment {
            samples: std::mem::take(&mut self.buffer),
            sample_rate: self.config.sample_rate,
            duration: speech_duration,
        };
        debug!(?speech_duration, samples = segment.samples.len(), "speech ended");
        Some(VadOutput::SpeechEnd(segment))
    }

    fn reset(&mut self) {
        self.speaking = false;
        self.buffer.clear();
        self.silence_samples = 0;
    }

    fn frame_size(&self) -> usize {
        self.config.window_size
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vad() -> EnergyVad {
        EnergyVad::new(EnergyVadConfig::default())
    }

    fn loud_frame() -> Vec<f32> {
        vec![0.5f32; 512]
    }

    fn quiet_frame() -> Vec<f32> {
        vec![0.0f32; 512]
    }

    /// Feed `ms` worth of frames, returning any outputs.
    fn feed(vad: &mut EnergyVad, frame: &[f32], ms: u64) -> Vec<VadOutput> {
        let frames = (ms * 16) / 512 + 1; // 512 samples = 32 ms at 16 kHz
        (0..frames).filter_map(|_| vad.push_frame(frame)).collect()
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms_volume(&quiet_frame()), 0.0);
        assert!(rms_volume(&loud_frame()) > 0.4);
    }

    #[test]
    fn speech_then_gap_commits_a_segment() {
        let mut vad = vad();

        let starts = feed(&mut vad, &loud_frame(), 500);
        assert!(matches!(starts[0], VadOutput::SpeechStart));
        assert_eq!(starts.len(), 1);

        let ends = feed(&mut vad, &quiet_frame(), 1600);
        assert_eq!(ends.len(), 1);
        match &ends[0] {
            VadOutput::SpeechEnd(segment) => {
                assert_eq!(segment.sample_rate, 16_000);
                assert!(segment.duration >= Duration::from_millis(400));
                assert!(!segment.samples.is_empty());
            }
            other => panic!("expected SpeechEnd, got {other:?}"),
        }
    }

    #[test]
    fn hundred_ms_burst_is_dropped_silently() {
        // 100 ms above threshold, then silence: below the 300 ms minimum,
        // so nothing may surface.
        let mut vad = vad();

        let outputs = feed(&mut vad, &loud_frame(), 100);
        assert!(matches!(outputs[0], VadOutput::SpeechStart));

        let rest = feed(&mut vad, &quiet_frame(), 2000);
        assert!(
            rest.is_empty(),
            "short burst must not produce a segment: {rest:?}"
        );
    }

    #[test]
    fn brief_pause_does_not_split_the_utterance() {
        let mut vad = vad();
        feed(&mut vad, &loud_frame(), 400);
        // 500 ms pause, below the 1500 ms gap.
        let mid = feed(&mut vad, &quiet_frame(), 500);
        assert!(mid.is_empty());
        feed(&mut vad, &loud_frame(), 400);

        let ends = feed(&mut vad, &quiet_frame(), 1600);
        assert_eq!(ends.len(), 1);
        assert!(matches!(ends[0], VadOutput::SpeechEnd(_)));
    }

    #[test]
    fn reset_discards_partial_speech() {
        let mut vad = vad();
        feed(&mut vad, &loud_frame(), 500);
        vad.reset();
        let outputs = feed(&mut vad, &quiet_frame(), 2000);
        assert!(outputs.is_empty());
    }
}
