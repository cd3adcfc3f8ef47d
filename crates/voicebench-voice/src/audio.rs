//! Audio capture, playback, and sample-format plumbing.
//!
//! Capture runs on CPAL: a continuous 16 kHz mono f32 stream delivered as
//! fixed-size frames through a callback. Playback goes through an
//! [`AudioSink`] so tests can substitute a silent sink for the rodio one.

use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Capture configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000).
    pub sample_rate: u32,

    /// Number of channels (default: 1, mono).
    pub channels: u16,

    /// Frame size in samples delivered per capture callback
    /// (default: 4096, ~256 ms at 16 kHz).
    pub frame_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_size: 4096,
        }
    }
}

impl AudioConfig {
    /// Capture config with a custom frame size (VAD strategies want their
    /// own window lengths).
    pub fn with_frame_size(frame_size: usize) -> Self {
        Self {
            frame_size,
            ..Self::default()
        }
    }
}

/// One frame of captured audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Samples, f32 normalized to -1.0..1.0.
    pub samples: Vec<f32>,
}

/// A VAD-delimited span of user speech.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Approximate speech duration (excludes trailing silence).
    pub duration: Duration,
}

impl AudioSegment {
    /// Package the segment as a 16-bit PCM WAV blob for batch upload.
    pub fn to_wav(&self) -> Vec<u8> {
        encode_wav_pcm16(&self.samples, self.sample_rate)
    }
}

/// Convert normalized f32 samples to 16-bit signed integers.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let clamped = s.clamp(-1.0, 1.0);
            if clamped < 0.0 {
                (clamped * 0x8000 as f32) as i16
            } else {
                (clamped * 0x7fff as f32) as i16
            }
        })
        .collect()
}

/// Convert normalized f32 samples to raw 16-bit little-endian PCM bytes,
/// the format the duplex ASR channel expects.
pub fn pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for value in f32_to_i16(samples) {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes.
pub fn encode_wav_pcm16(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = samples.len() * 2;
    let file_len = 44u32 + data_len as u32;

    let mut buf = Vec::with_capacity(44 + data_len);
    let _ = buf.write_all(b"RIFF");
    let _ = buf.write_all(&(file_len - 8).to_le_bytes());
    let _ = buf.write_all(b"WAVE");
    // fmt subchunk
    let _ = buf.write_all(b"fmt ");
    let _ = buf.write_all(&16u32.to_le_bytes());
    let _ = buf.write_all(&1u16.to_le_bytes()); // PCM
    let _ = buf.write_all(&1u16.to_le_bytes()); // mono
    let _ = buf.write_all(&sample_rate.to_le_bytes());
    let _ = buf.write_all(&(sample_rate * 2).to_le_bytes()); // byte rate
    let _ = buf.write_all(&2u16.to_le_bytes()); // block align
    let _ = buf.write_all(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    let _ = buf.write_all(b"data");
    let _ = buf.write_all(&(data_len as u32).to_le_bytes());
    for value in f32_to_i16(samples) {
        let _ = buf.write_all(&value.to_le_bytes());
    }
    buf
}

/// Microphone capture via CPAL.
pub struct AudioCapture {
    config: AudioConfig,
    device: Device,
    stream_config: StreamConfig,
}

impl AudioCapture {
    pub fn new(config: AudioConfig) -> PipelineResult<Self> {
        let device = cpal::default_host().default_input_device().ok_or_else(|| {
            PipelineError::Microphone("no input device available".to_string())
        })?;

        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate = config.sample_rate,
            "initializing audio capture"
        );

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.frame_size as u32),
        };

        Ok(Self {
            config,
            device,
            stream_config,
        })
    }

    /// Start capturing. `on_frame` is invoked with full frames of
    /// `frame_size` samples from the hardware callback thread. The
    /// returned stream must be kept alive; dropping it releases the
    /// microphone.
    pub fn start<F>(self, on_frame: F) -> PipelineResult<Stream>
    where
        F: Fn(AudioFrame) + Send + 'static,
    {
        let frame_size = self.config.frame_size;
        let mut pending = Vec::with_capacity(frame_size);

        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push(sample);
                    if pending.len() >= frame_size {
                        on_frame(AudioFrame {
                            samples: std::mem::replace(
                                &mut pending,
                                Vec::with_capacity(frame_size),
                            ),
                        });
                    }
                }
            },
            move |err| {
                warn!("audio stream error: {err}");
            },
            None,
        )?;

        stream.play()?;
        info!("audio capture started");

        Ok(stream)
    }

    /// Names of the available input devices.
    pub fn list_input_devices() -> PipelineResult<Vec<String>> {
        let host = cpal::default_host();
        let mut names = Vec::new();
        for device in host.input_devices()? {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }
}

/// Playback seam. `begin` returns once playback has started; `drain`
/// resolves when the queued audio has finished.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Decode and enqueue an audio blob (WAV/MP3). Playback is considered
    /// started when this returns. Empty input is a no-op.
    fn begin(&self, audio: &[u8]) -> PipelineResult<()>;

    /// Wait for everything queued so far to finish playing.
    async fn drain(&self);

    /// Stop immediately and clear the queue.
    fn halt(&self);

    fn is_playing(&self) -> bool;
}

/// Rodio-backed sink. The output stream is not `Send`, so it lives on a
/// dedicated thread for the lifetime of the sink; the `rodio::Sink`
/// handle itself is shareable.
pub struct RodioSink {
    sink: Arc<rodio::Sink>,
    // Dropping this sender ends the holder thread, releasing the device.
    _shutdown: std::sync::mpsc::Sender<()>,
}

impl RodioSink {
    pub fn new() -> PipelineResult<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        std::thread::spawn(move || {
            let built = rodio::OutputStream::try_default()
                .map_err(|e| PipelineError::Playback(e.to_string()))
                .and_then(|(stream, handle)| {
                    rodio::Sink::try_new(&handle)
                        .map(|sink| (stream, Arc::new(sink)))
                        .map_err(|e| PipelineError::Playback(e.to_string()))
                });

            match built {
                Ok((stream, sink)) => {
                    let _ = ready_tx.send(Ok(Arc::clone(&sink)));
                    // Hold the output stream until the sink is dropped.
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        let sink = ready_rx
            .recv()
            .map_err(|_| PipelineError::Playback("playback thread died".to_string()))??;

        info!("audio playback sink ready");

        Ok(Self {
            sink,
            _shutdown: shutdown_tx,
        })
    }
}

#[async_trait]
impl AudioSink for RodioSink {
    fn begin(&self, audio: &[u8]) -> PipelineResult<()> {
        if audio.is_empty() {
            return Ok(());
        }
        let cursor = std::io::Cursor::new(audio.to_vec());
        let source = rodio::Decoder::new(cursor)
            .map_err(|e| PipelineError::Playback(format!("decode failed: {e}")))?;
        use rodio::Source;
        self.sink.append(source.convert_samples::<f32>());
        Ok(())
    }

    async fn drain(&self) {
        let sink = Arc::clone(&self.sink);
        let _ = tokio::task::spawn_blocking(move || sink.sleep_until_end()).await;
    }

    fn halt(&self) {
        self.sink.stop();
    }

    fn is_playing(&self) -> bool {
        !self.sink.empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_config_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.sample_rate, 16_000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.frame_size, 4096);
    }

    #[test]
    fn f32_to_i16_clamps_and_scales() {
        let out = f32_to_i16(&[0.0, 1.0, -1.0, 2.0, -2.0]);
        assert_eq!(out, vec![0, 0x7fff, -0x8000, 0x7fff, -0x8000]);
    }

    #[test]
    fn pcm16_bytes_are_little_endian() {
        let out = pcm16_bytes(&[1.0]);
        assert_eq!(out, vec![0xff, 0x7f]);
    }

    #[test]
    fn wav_header_is_well_formed() {
        let samples = vec![0.0f32; 480];
        let wav = encode_wav_pcm16(&samples, 16_000);

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");
        // 44-byte header + 2 bytes per sample
        assert_eq!(wav.len(), 44 + 480 * 2);
        // mono, 16 kHz
        assert_eq!(u16::from_le_bytes([wav[22], wav[23]]), 1);
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16_000);
    }

    #[test]
    fn segment_wav_length_matches_samples() {
        let segment = AudioSegment {
            samples: vec![0.1f32; 1600],
            sample_rate: 16_000,
            duration: Duration::from_millis(100),
        };
        assert_eq!(segment.to_wav().len(), 44 + 1600 * 2);
    }
}
