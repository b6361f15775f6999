//! Transcript event domain model.
//!
//! Events are the ground truth for replay and audit: every observable action
//! in a run serializes into one strictly ordered, append-only stream. Nothing
//! is ever mutated or deleted after append.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::run::Phase;

/// Monotonically increasing position of an event within one run's transcript.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of transcript event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    ToolInvocationStart,
    ToolInvocationResult,
    PhaseTransition,
    SubagentSpawned,
    SubagentStop,
    DeltaProposed,
    DeltaDecided,
    RunFinalized,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::ToolInvocationStart => "tool_invocation_start",
            Self::ToolInvocationResult => "tool_invocation_result",
            Self::PhaseTransition => "phase_transition",
            Self::SubagentSpawned => "subagent_spawned",
            Self::SubagentStop => "subagent_stop",
            Self::DeltaProposed => "delta_proposed",
            Self::DeltaDecided => "delta_decided",
            Self::RunFinalized => "run_finalized",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single immutable record in a run's transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    /// Strictly increasing, gap-free within a run.
    pub sequence: SequenceNumber,
    /// Run this event belongs to.
    pub run_id: Uuid,
    /// Subagent that produced the event, when not the parent control flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_id: Option<Uuid>,
    /// Wall-clock timestamp at append time.
    pub timestamp: DateTime<Utc>,
    /// Event kind from the closed set.
    pub kind: EventKind,
    /// Kind-specific structured payload.
    pub payload: Value,
}

/// An event before sequence assignment.
///
/// The recorder is the sole writer: it assigns the sequence number and
/// timestamp atomically with the append, so drafts carry everything else.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: EventKind,
    pub subagent_id: Option<Uuid>,
    pub payload: Value,
}

impl EventDraft {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            subagent_id: None,
            payload,
        }
    }

    pub fn with_subagent(mut self, subagent_id: Uuid) -> Self {
        self.subagent_id = Some(subagent_id);
        self
    }
}

/// Payload of a `PhaseTransition` event; the full phase timeline of a run is
/// reconstructible from these alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransitionPayload {
    pub from_phase: Phase,
    pub to_phase: Phase,
    pub retry_count: u32,
    /// Explanation for the transition.
    pub trigger_reason: String,
}

impl PhaseTransitionPayload {
    pub fn into_draft(self) -> EventDraft {
        let payload = serde_json::to_value(&self).unwrap_or(Value::Null);
        EventDraft::new(EventKind::PhaseTransition, payload)
    }
}
