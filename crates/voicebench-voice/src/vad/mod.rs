//! Voice activity detection strategies for batch-only ASR vendors.
//!
//! Two interchangeable strategies sit behind [`VadStrategy`]: a cheap
//! energy threshold ([`energy::EnergyVad`]) and a classifier-backed one
//! with hysteresis ([`neural::NeuralVad`]). Both are push-based frame
//! processors; time thresholds are counted in samples so behavior is
//! deterministic offline.

pub mod energy;
pub mod neural;

pub use energy::{EnergyVad, EnergyVadConfig};
pub use neural::{NeuralVad, NeuralVadConfig, SpeechModel, WebRtcSpeechModel};

use crate::audio::AudioSegment;

/// What feeding one frame produced.
#[derive(Debug)]
pub enum VadOutput {
    /// The user started speaking.
    SpeechStart,
    /// The user stopped; the buffered utterance is attached.
    SpeechEnd(AudioSegment),
    /// A segment was captured but rejected as too short. Must never reach
    /// batch transcription.
    Misfire,
}

/// A push-based speech detector. Feed frames of mono f32 PCM; at most one
/// output per frame. Frame length requirements are strategy-specific
/// (`frame_size()`).
pub trait VadStrategy {
    fn push_frame(&mut self, frame: &[f32]) -> Option<VadOutput>;

    /// Forget any partially captured speech.
    fn reset(&mut self);

    /// Expected samples per frame.
    fn frame_size(&self) -> usize;

    fn sample_rate(&self) -> u32;
}
