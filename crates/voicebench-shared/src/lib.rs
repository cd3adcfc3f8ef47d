//! # voicebench-shared — pipeline vocabulary
//!
//! Types shared between the voice orchestration core and anything that
//! observes it: the append-only session event log, the client↔server wire
//! messages, and the per-turn / session-level metrics with their cost
//! arithmetic.
//!
//! Everything here is plain data plus pure functions; no I/O.

pub mod events;
pub mod metrics;
pub mod wire;

pub use events::{Event, EventKind, EventLog, EventLogger, SessionEndReason};
pub use metrics::{
    estimate_costs, latencies_from_events, session_metrics, summarize, usage_from_events,
    AverageMetrics, CostBreakdown, EventLatencies, SessionMetrics, SessionSummary, StageMetrics,
    Turn, TurnMetrics, UsageTotals,
};
pub use wire::{decode_audio, encode_audio, ClientMessage, ServerMessage};
