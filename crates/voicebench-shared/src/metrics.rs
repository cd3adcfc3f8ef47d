//! Per-turn and session-level latency, usage, and cost metrics.
//!
//! Two views exist side by side: the orchestrator-side view built from the
//! session's turn list ([`summarize`]) and the event-log view built from
//! raw [`Event`]s ([`latencies_from_events`], [`usage_from_events`]).
//!
//! Convention: every "no applicable data" case yields `0.0`, never
//! NaN/None. A zero reading means "not measured" and downstream display
//! and cost math rely on that (zero usage ⇒ zero cost).

use crate::events::{Event, EventKind, EventLog};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Time-to-first-byte and total elapsed time for one pipeline stage, in
/// milliseconds. Both are non-negative; zero means "not measured".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    #[serde(rename = "ttfb")]
    pub ttfb_ms: f64,
    #[serde(rename = "total")]
    pub total_ms: f64,
}

impl StageMetrics {
    pub fn new(ttfb_ms: f64, total_ms: f64) -> Self {
        Self { ttfb_ms, total_ms }
    }
}

/// Timing for one complete turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetrics {
    pub asr: StageMetrics,
    pub llm: StageMetrics,
    pub tts: StageMetrics,
    /// Turn start (speech end) to the start of audio playback, in ms.
    #[serde(rename = "roundTrip")]
    pub round_trip_ms: f64,
}

/// One user-utterance → assistant-reply → synthesized-audio cycle.
/// Immutable once appended to the session's turn list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Monotonically increasing, starting at 1.
    pub id: u64,
    #[serde(rename = "userText")]
    pub user_text: String,
    #[serde(rename = "assistantText")]
    pub assistant_text: String,
    pub metrics: TurnMetrics,
    pub timestamp: DateTime<Utc>,
}

/// Arithmetic means across all turns; all zeros when there were none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageMetrics {
    pub asr: StageMetrics,
    pub llm: StageMetrics,
    pub tts: StageMetrics,
    #[serde(rename = "roundTrip")]
    pub round_trip_ms: f64,
}

/// End-of-session report handed to the session-end callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub turns: Vec<Turn>,
    #[serde(rename = "totalDuration")]
    pub total_duration_ms: u64,
    #[serde(rename = "averageMetrics")]
    pub average: AverageMetrics,
}

/// Reduce a turn list into a session summary.
pub fn summarize(turns: Vec<Turn>, total_duration: Duration) -> SessionSummary {
    let mut average = AverageMetrics::default();

    if !turns.is_empty() {
        for turn in &turns {
            average.asr.ttfb_ms += turn.metrics.asr.ttfb_ms;
            average.asr.total_ms += turn.metrics.asr.total_ms;
            average.llm.ttfb_ms += turn.metrics.llm.ttfb_ms;
            average.llm.total_ms += turn.metrics.llm.total_ms;
            average.tts.ttfb_ms += turn.metrics.tts.ttfb_ms;
            average.tts.total_ms += turn.metrics.tts.total_ms;
            average.round_trip_ms += turn.metrics.round_trip_ms;
        }

        let count = turns.len() as f64;
        average.asr.ttfb_ms /= count;
        average.asr.total_ms /= count;
        average.llm.ttfb_ms /= count;
        average.llm.total_ms /= count;
        average.tts.ttfb_ms /= count;
        average.tts.total_ms /= count;
        average.round_trip_ms /= count;
    }

    SessionSummary {
        turns,
        total_duration_ms: total_duration.as_millis() as u64,
        average,
    }
}

// ---------------------------------------------------------------------------
// Usage and cost
// ---------------------------------------------------------------------------

/// Billable quantities accumulated over a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    #[serde(rename = "audioMinutes")]
    pub audio_minutes: f64,
    #[serde(rename = "tokensInput")]
    pub tokens_input: u64,
    #[serde(rename = "tokensOutput")]
    pub tokens_output: u64,
    pub characters: u64,
}

/// Fixed per-unit vendor pricing.
pub mod pricing {
    /// Deepgram Nova-2 streaming, USD per audio minute.
    pub const DEEPGRAM_NOVA2_PER_MINUTE: f64 = 0.0043;
    /// OpenAI GPT-4o, USD per 1K input tokens.
    pub const OPENAI_GPT4O_INPUT_PER_1K: f64 = 0.0025;
    /// OpenAI GPT-4o, USD per 1K output tokens.
    pub const OPENAI_GPT4O_OUTPUT_PER_1K: f64 = 0.01;
    /// ElevenLabs Turbo v2, USD per synthesized character.
    pub const ELEVENLABS_TURBO_V2_PER_CHARACTER: f64 = 0.0003;
}

/// Estimated spend per vendor, USD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub asr: f64,
    pub llm: f64,
    pub tts: f64,
    pub total: f64,
}

/// Usage × fixed pricing. Zero usage always yields zero cost.
pub fn estimate_costs(usage: &UsageTotals) -> CostBreakdown {
    let asr = usage.audio_minutes * pricing::DEEPGRAM_NOVA2_PER_MINUTE;
    let llm = (usage.tokens_input as f64 / 1000.0) * pricing::OPENAI_GPT4O_INPUT_PER_1K
        + (usage.tokens_output as f64 / 1000.0) * pricing::OPENAI_GPT4O_OUTPUT_PER_1K;
    let tts = usage.characters as f64 * pricing::ELEVENLABS_TURBO_V2_PER_CHARACTER;

    CostBreakdown {
        asr,
        llm,
        tts,
        total: asr + llm + tts,
    }
}

/// Accumulate billable usage from the event log.
pub fn usage_from_events(events: &[Event]) -> UsageTotals {
    let mut usage = UsageTotals::default();

    for event in events {
        match &event.kind {
            EventKind::SessionEnd { duration_ms, .. } => {
                usage.audio_minutes = *duration_ms as f64 / 1000.0 / 60.0;
            }
            EventKind::LlmComplete {
                tokens_input,
                tokens_output,
                ..
            } => {
                usage.tokens_input += tokens_input;
                usage.tokens_output += tokens_output;
            }
            EventKind::TtsStart {
                character_count, ..
            } => {
                usage.characters += *character_count as u64;
            }
            _ => {}
        }
    }

    usage
}

// ---------------------------------------------------------------------------
// Event-log latencies
// ---------------------------------------------------------------------------

/// Average/min/max over a set of per-utterance latencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

/// Latencies reconstructed from the raw event log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLatencies {
    /// Speech end → first TTS audio chunk, in ms. Measured from when the
    /// user stopped talking, not from when processing began.
    #[serde(rename = "timeToFirstResponse")]
    pub time_to_first_response_ms: f64,
    pub asr: LatencyStats,
    #[serde(rename = "llmTimeToFirstToken")]
    pub llm_time_to_first_token_ms: f64,
    #[serde(rename = "llmTimeToComplete")]
    pub llm_time_to_complete_ms: f64,
    #[serde(rename = "ttsTimeToFirstChunk")]
    pub tts_time_to_first_chunk_ms: f64,
}

/// Compute latency metrics from the ordered event list.
pub fn latencies_from_events(events: &[Event]) -> EventLatencies {
    let mut out = EventLatencies::default();

    // Speech end → first TTS audio: anchor on the *last* finalized
    // transcript and the first first-chunk event after it.
    let last_final = events
        .iter()
        .rev()
        .find(|e| matches!(e.kind, EventKind::AsrFinal { .. }));
    if let Some(final_event) = last_final {
        if let EventKind::AsrFinal { speech_end_ms, .. } = &final_event.kind {
            let first_tts_audio = events.iter().find(|e| {
                matches!(e.kind, EventKind::TtsAudioChunk { is_first: true, .. })
                    && e.timestamp_ms > final_event.timestamp_ms
            });
            if let Some(chunk) = first_tts_audio {
                out.time_to_first_response_ms = (chunk.timestamp_ms - speech_end_ms) as f64;
            }
        }
    }

    // ASR latency per utterance: finalize timestamp minus the closest
    // audio-chunk-received timestamp strictly before it.
    let mut asr_latencies = Vec::new();
    for event in events {
        if !matches!(event.kind, EventKind::AsrFinal { .. }) {
            continue;
        }
        let prior_audio = events
            .iter()
            .filter(|e| {
                matches!(e.kind, EventKind::AudioChunkReceived { .. })
                    && e.timestamp_ms < event.timestamp_ms
            })
            .max_by_key(|e| e.timestamp_ms);
        if let Some(audio) = prior_audio {
            asr_latencies.push((event.timestamp_ms - audio.timestamp_ms) as f64);
        }
    }
    if !asr_latencies.is_empty() {
        out.asr.average = asr_latencies.iter().sum::<f64>() / asr_latencies.len() as f64;
        out.asr.min = asr_latencies.iter().cloned().fold(f64::INFINITY, f64::min);
        out.asr.max = asr_latencies
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
    }

    // LLM: relative to the last llm_start.
    let last_llm_start = events
        .iter()
        .rev()
        .find(|e| matches!(e.kind, EventKind::LlmStart { .. }));
    if let Some(start) = last_llm_start {
        let first_token = events.iter().find(|e| {
            matches!(e.kind, EventKind::LlmToken { is_first: true, .. })
                && e.timestamp_ms > start.timestamp_ms
        });
        if let Some(token) = first_token {
            out.llm_time_to_first_token_ms = (token.timestamp_ms - start.timestamp_ms) as f64;
        }

        let complete = events.iter().find(|e| {
            matches!(e.kind, EventKind::LlmComplete { .. }) && e.timestamp_ms > start.timestamp_ms
        });
        if let Some(complete) = complete {
            out.llm_time_to_complete_ms = (complete.timestamp_ms - start.timestamp_ms) as f64;
        }
    }

    // TTS: last tts_start → first first-chunk after it.
    let last_tts_start = events
        .iter()
        .rev()
        .find(|e| matches!(e.kind, EventKind::TtsStart { .. }));
    if let Some(start) = last_tts_start {
        let first_chunk = events.iter().find(|e| {
            matches!(e.kind, EventKind::TtsAudioChunk { is_first: true, .. })
                && e.timestamp_ms > start.timestamp_ms
        });
        if let Some(chunk) = first_chunk {
            out.tts_time_to_first_chunk_ms = (chunk.timestamp_ms - start.timestamp_ms) as f64;
        }
    }

    out
}

/// Full event-derived metrics bundle: latencies, usage, and costs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub latencies: EventLatencies,
    pub usage: UsageTotals,
    pub costs: CostBreakdown,
}

pub fn session_metrics(log: &EventLog) -> SessionMetrics {
    let latencies = latencies_from_events(&log.events);
    let usage = usage_from_events(&log.events);
    let costs = estimate_costs(&usage);

    SessionMetrics {
        latencies,
        usage,
        costs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionEndReason;

    fn event(timestamp_ms: i64, kind: EventKind) -> Event {
        Event {
            session_id: "s".to_string(),
            timestamp_ms,
            kind,
        }
    }

    fn turn(id: u64, round_trip_ms: f64) -> Turn {
        Turn {
            id,
            user_text: format!("user {id}"),
            assistant_text: format!("assistant {id}"),
            metrics: TurnMetrics {
                asr: StageMetrics::new(100.0, 200.0),
                llm: StageMetrics::new(300.0, 600.0),
                tts: StageMetrics::new(150.0, 400.0),
                round_trip_ms,
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn empty_turn_list_summarizes_to_zeros() {
        let summary = summarize(Vec::new(), Duration::from_millis(1000));
        assert_eq!(summary.turns.len(), 0);
        assert_eq!(summary.total_duration_ms, 1000);
        assert_eq!(summary.average.round_trip_ms, 0.0);
        assert_eq!(summary.average.asr.ttfb_ms, 0.0);
        assert_eq!(summary.average.tts.total_ms, 0.0);
        assert!(summary.average.llm.ttfb_ms.is_finite());
    }

    #[test]
    fn averages_are_arithmetic_means() {
        let summary = summarize(vec![turn(1, 1000.0), turn(2, 2000.0)], Duration::from_secs(10));
        assert_eq!(summary.average.round_trip_ms, 1500.0);
        assert_eq!(summary.average.asr.ttfb_ms, 100.0);
        assert_eq!(summary.average.llm.total_ms, 600.0);
        assert_eq!(summary.turns.len(), 2);
    }

    #[test]
    fn zero_usage_costs_nothing() {
        let costs = estimate_costs(&UsageTotals::default());
        assert_eq!(costs.total, 0.0);
        assert_eq!(costs.asr, 0.0);
        assert_eq!(costs.llm, 0.0);
        assert_eq!(costs.tts, 0.0);
    }

    #[test]
    fn costs_scale_with_usage() {
        let usage = UsageTotals {
            audio_minutes: 2.0,
            tokens_input: 1000,
            tokens_output: 2000,
            characters: 100,
        };
        let costs = estimate_costs(&usage);
        assert!((costs.asr - 0.0086).abs() < 1e-9);
        assert!((costs.llm - (0.0025 + 0.02)).abs() < 1e-9);
        assert!((costs.tts - 0.03).abs() < 1e-9);
        assert!((costs.total - (costs.asr + costs.llm + costs.tts)).abs() < 1e-12);
    }

    #[test]
    fn empty_event_log_yields_zero_latencies() {
        let latencies = latencies_from_events(&[]);
        assert_eq!(latencies.time_to_first_response_ms, 0.0);
        assert_eq!(latencies.asr.average, 0.0);
        assert_eq!(latencies.llm_time_to_first_token_ms, 0.0);
        assert_eq!(latencies.tts_time_to_first_chunk_ms, 0.0);
    }

    #[test]
    fn time_to_first_response_measures_from_speech_end() {
        let events = vec![
            event(
                1000,
                EventKind::AsrFinal {
                    text: "hello".to_string(),
                    speech_end_ms: 900,
                },
            ),
            event(
                1400,
                EventKind::TtsAudioChunk {
                    size: 512,
                    is_first: true,
                },
            ),
        ];
        let latencies = latencies_from_events(&events);
        // 1400 - 900 (speech end), not 1400 - 1000 (finalize).
        assert_eq!(latencies.time_to_first_response_ms, 500.0);
    }

    #[test]
    fn asr_latency_uses_closest_prior_audio_chunk() {
        let events = vec![
            event(100, EventKind::AudioChunkReceived { size: 4096 }),
            event(700, EventKind::AudioChunkReceived { size: 4096 }),
            event(
                1000,
                EventKind::AsrFinal {
                    text: "one".to_string(),
                    speech_end_ms: 950,
                },
            ),
            event(1500, EventKind::AudioChunkReceived { size: 4096 }),
            event(
                1600,
                EventKind::AsrFinal {
                    text: "two".to_string(),
                    speech_end_ms: 1550,
                },
            ),
        ];
        let latencies = latencies_from_events(&events);
        // 1000-700 = 300 and 1600-1500 = 100; never 1000-100.
        assert_eq!(latencies.asr.min, 100.0);
        assert_eq!(latencies.asr.max, 300.0);
        assert_eq!(latencies.asr.average, 200.0);
    }

    #[test]
    fn llm_latencies_anchor_on_last_start() {
        let events = vec![
            event(
                100,
                EventKind::LlmStart {
                    prompt: "old".to_string(),
                },
            ),
            event(
                2000,
                EventKind::LlmStart {
                    prompt: "new".to_string(),
                },
            ),
            event(
                2250,
                EventKind::LlmToken {
                    token: "Hi".to_string(),
                    is_first: true,
                },
            ),
            event(
                2900,
                EventKind::LlmComplete {
                    full_text: "Hi!".to_string(),
                    tokens_input: 10,
                    tokens_output: 3,
                },
            ),
        ];
        let latencies = latencies_from_events(&events);
        assert_eq!(latencies.llm_time_to_first_token_ms, 250.0);
        assert_eq!(latencies.llm_time_to_complete_ms, 900.0);
    }

    #[test]
    fn usage_accumulates_across_events() {
        let events = vec![
            event(
                0,
                EventKind::SessionStart {
                    system_prompt: "p".to_string(),
                    llm_model: "gpt-4o".to_string(),
                    tts_voice: "alloy".to_string(),
                },
            ),
            event(
                500,
                EventKind::LlmComplete {
                    full_text: "a".to_string(),
                    tokens_input: 10,
                    tokens_output: 5,
                },
            ),
            event(
                900,
                EventKind::TtsStart {
                    text: "hello".to_string(),
                    character_count: 5,
                },
            ),
            event(
                60_000,
                EventKind::SessionEnd {
                    reason: SessionEndReason::Timeout,
                    duration_ms: 60_000,
                },
            ),
        ];
        let usage = usage_from_events(&events);
        assert_eq!(usage.audio_minutes, 1.0);
        assert_eq!(usage.tokens_input, 10);
        assert_eq!(usage.tokens_output, 5);
        assert_eq!(usage.characters, 5);
    }
}
