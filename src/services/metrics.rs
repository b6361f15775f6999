//! Run metrics aggregation.
//!
//! Metrics are a pure function of the transcript: nothing is collected at
//! runtime, everything is derived after the fact from the event log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::event::{EventKind, PhaseTransitionPayload, TranscriptEvent};
use crate::domain::models::run::Phase;

/// Aggregated metrics for one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetrics {
    /// Times the phase was entered.
    pub entry_count: u32,
    /// Total wall-clock time spent in the phase.
    pub total_duration_seconds: f64,
}

/// Aggregated metrics for one run, derived from its transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Per-phase entry counts and durations.
    pub phases: BTreeMap<Phase, PhaseMetrics>,
    /// Event counts by kind.
    pub events_by_kind: BTreeMap<String, u64>,
    /// Tool invocations observed.
    pub tool_invocations: u64,
    /// Subagent sessions spawned.
    pub subagents_spawned: u64,
    /// Total events.
    pub total_events: u64,
    /// Transcript span, when the run produced at least one event.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunMetrics {
    /// Aggregate a run's ordered events.
    pub fn from_events(events: &[TranscriptEvent]) -> Self {
        let mut metrics = Self {
            started_at: events.first().map(|e| e.timestamp),
            finished_at: events.last().map(|e| e.timestamp),
            total_events: events.len() as u64,
            ..Self::default()
        };

        // Phase durations: each transition closes the previous phase's span.
        let mut open_phase: Option<(Phase, DateTime<Utc>)> = None;
        let run_start = metrics.started_at;

        for event in events {
            *metrics
                .events_by_kind
                .entry(event.kind.as_str().to_string())
                .or_insert(0) += 1;

            match event.kind {
                EventKind::ToolInvocationStart => metrics.tool_invocations += 1,
                EventKind::SubagentSpawned => metrics.subagents_spawned += 1,
                EventKind::PhaseTransition => {
                    if let Ok(payload) =
                        serde_json::from_value::<PhaseTransitionPayload>(event.payload.clone())
                    {
                        let (closing_phase, opened_at) = open_phase
                            .take()
                            .unwrap_or((payload.from_phase, run_start.unwrap_or(event.timestamp)));
                        let closed = metrics.phases.entry(closing_phase).or_default();
                        closed.total_duration_seconds +=
                            duration_seconds(opened_at, event.timestamp);

                        let entered = metrics.phases.entry(payload.to_phase).or_default();
                        entered.entry_count += 1;
                        open_phase = Some((payload.to_phase, event.timestamp));
                    }
                }
                _ => {}
            }
        }

        // Close the final open phase at the last event.
        if let (Some((phase, opened_at)), Some(finished)) = (open_phase, metrics.finished_at) {
            metrics
                .phases
                .entry(phase)
                .or_default()
                .total_duration_seconds += duration_seconds(opened_at, finished);
        }

        metrics
    }
}

fn duration_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}
