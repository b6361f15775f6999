//! Transcript replay.
//!
//! Every component's observable behavior is only visible through the event
//! log, which makes the transcript the replay substrate: re-applying a closed
//! run's events in order reproduces the same terminal run and proposal
//! states. This module is pure; it never touches storage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::delta::DeltaDecision;
use crate::domain::models::event::{EventKind, PhaseTransitionPayload, TranscriptEvent};
use crate::domain::models::run::{Phase, RunOutcome};

/// Terminal state reconstructed from a run's transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReplayedRun {
    /// Final phase reached (from the last phase transition, or Plan when the
    /// transcript holds none).
    pub final_phase: Option<Phase>,
    /// Terminal outcome from the `run_finalized` event, when the run closed.
    pub outcome: Option<RunOutcome>,
    /// Retry counters per re-entered phase.
    pub retries: BTreeMap<Phase, u32>,
    /// Decision per proposal identifier.
    pub decisions: BTreeMap<Uuid, DeltaDecision>,
    /// Proposals seen, in proposal order.
    pub proposed: Vec<Uuid>,
    /// Number of events replayed.
    pub event_count: u64,
}

/// Replay a run's events in order.
///
/// Fails when the sequence numbers are not strictly increasing and gap-free,
/// which would mean the transcript was tampered with or truncated mid-stream.
pub fn replay(events: &[TranscriptEvent]) -> DomainResult<ReplayedRun> {
    let mut replayed = ReplayedRun::default();

    for (i, event) in events.iter().enumerate() {
        let expected = events[0].sequence.0 + i as u64;
        if event.sequence.0 != expected {
            return Err(DomainError::ValidationFailed(format!(
                "transcript gap at sequence {}: expected {expected}",
                event.sequence
            )));
        }

        match event.kind {
            EventKind::PhaseTransition => {
                let payload: PhaseTransitionPayload =
                    serde_json::from_value(event.payload.clone())?;
                replayed.final_phase = Some(payload.to_phase);
                if payload.retry_count > 0 {
                    let counter = replayed.retries.entry(payload.to_phase).or_insert(0);
                    *counter = (*counter).max(payload.retry_count);
                }
            }
            EventKind::DeltaProposed => {
                if let Some(id) = extract_uuid(&event.payload, "id") {
                    replayed.proposed.push(id);
                }
            }
            EventKind::DeltaDecided => {
                let id = extract_uuid(&event.payload, "proposal_id").ok_or_else(|| {
                    DomainError::ValidationFailed(format!(
                        "delta_decided event {} missing proposal_id",
                        event.sequence
                    ))
                })?;
                let decision: DeltaDecision =
                    serde_json::from_value(event.payload["decision"].clone())?;
                // Proposals terminate exactly once; keep the first decision.
                replayed.decisions.entry(id).or_insert(decision);
            }
            EventKind::RunFinalized => {
                let outcome: RunOutcome =
                    serde_json::from_value(event.payload["outcome"].clone())?;
                replayed.final_phase = Some(match outcome {
                    RunOutcome::Complete => Phase::Complete,
                    RunOutcome::Aborted { .. } => Phase::Aborted,
                });
                replayed.outcome.get_or_insert(outcome);
            }
            _ => {}
        }

        replayed.event_count += 1;
    }

    Ok(replayed)
}

fn extract_uuid(payload: &serde_json::Value, field: &str) -> Option<Uuid> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}
