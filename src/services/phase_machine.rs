//! Phase state machine.
//!
//! A pure transition function drives the Plan→Build→Test→Review→Document
//! loop: `(state, event) -> (state', effects)`. Side effects (transcript
//! writes, governance, summary emission) are executed by the outer driver,
//! which keeps the deterministic core isolated from I/O.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::run::Phase;

/// Pure phase-machine state: the current phase plus retry counters for
/// re-entered phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase: Phase,
    pub retries: BTreeMap<Phase, u32>,
}

impl PhaseState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Plan,
            retries: BTreeMap::new(),
        }
    }

    pub fn retry_count(&self, phase: Phase) -> u32 {
        self.retries.get(&phase).copied().unwrap_or(0)
    }
}

impl Default for PhaseState {
    fn default() -> Self {
        Self::new()
    }
}

/// Inputs that advance the phase machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseEvent {
    /// A finalized plan artifact was recorded.
    PlanRecorded { proposal_id: Uuid },
    /// Build-phase tool invocations completed without fatal error.
    BuildSucceeded,
    /// Build hit a fatal error.
    BuildFailed { reason: String },
    /// Test execution completed (pass or fail) with an attached result.
    TestCompleted { passed: bool },
    /// The governor produced a decision for every build-phase proposal.
    ReviewCompleted { revision_requested: bool },
    /// The closing summary artifact was recorded.
    SummaryRecorded,
    /// Unrecoverable error from a collaborator.
    CollaboratorFailed { reason: String },
    /// The overall run deadline elapsed.
    RunTimedOut,
}

/// Side effects requested by a transition, executed by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    /// Append a `phase_transition` transcript event.
    EmitTransition {
        from: Phase,
        to: Phase,
        retry_count: u32,
        trigger_reason: String,
    },
    /// Finalize the run as aborted with the given reason.
    AbortRun { reason: String },
    /// Finalize the run as complete.
    CompleteRun,
}

/// Advance the machine by one event.
///
/// Deterministic and side-effect free. Events that are invalid for the
/// current phase are rejected with `InvalidStateTransition` and leave the
/// caller's state untouched.
pub fn transition(
    state: &PhaseState,
    event: &PhaseEvent,
    max_retries: u32,
) -> DomainResult<(PhaseState, Vec<Effect>)> {
    // Abort paths are valid from every non-terminal phase.
    match event {
        PhaseEvent::CollaboratorFailed { reason } => {
            return abort(state, format!("collaborator failure: {reason}"));
        }
        PhaseEvent::RunTimedOut => {
            return abort(state, "run timeout exceeded".to_string());
        }
        _ => {}
    }

    let mut next = state.clone();
    let effects = match (state.phase, event) {
        (Phase::Plan, PhaseEvent::PlanRecorded { proposal_id }) => {
            next.phase = Phase::Build;
            vec![emit(
                state,
                Phase::Build,
                0,
                format!("plan artifact {proposal_id} recorded"),
            )]
        }
        (Phase::Build, PhaseEvent::BuildSucceeded) => {
            next.phase = Phase::Test;
            vec![emit(
                state,
                Phase::Test,
                state.retry_count(Phase::Build),
                "build completed without fatal error".to_string(),
            )]
        }
        (Phase::Build, PhaseEvent::BuildFailed { reason }) => {
            return abort(state, format!("build failed: {reason}"));
        }
        (Phase::Test, PhaseEvent::TestCompleted { passed: true }) => {
            next.phase = Phase::Review;
            vec![emit(
                state,
                Phase::Review,
                state.retry_count(Phase::Build),
                "tests passed with result artifact attached".to_string(),
            )]
        }
        (Phase::Test, PhaseEvent::TestCompleted { passed: false }) => {
            return retry_build(state, max_retries, "tests failed");
        }
        (Phase::Review, PhaseEvent::ReviewCompleted { revision_requested: false }) => {
            next.phase = Phase::Document;
            vec![emit(
                state,
                Phase::Document,
                state.retry_count(Phase::Build),
                "every proposal decided".to_string(),
            )]
        }
        (Phase::Review, PhaseEvent::ReviewCompleted { revision_requested: true }) => {
            return retry_build(state, max_retries, "revision requested");
        }
        (Phase::Document, PhaseEvent::SummaryRecorded) => {
            next.phase = Phase::Complete;
            vec![
                emit(
                    state,
                    Phase::Complete,
                    state.retry_count(Phase::Build),
                    "closing summary recorded".to_string(),
                ),
                Effect::CompleteRun,
            ]
        }
        (phase, event) => {
            return Err(DomainError::InvalidStateTransition {
                from: phase.to_string(),
                to: format!("{event:?}"),
                reason: "event is not valid in this phase".to_string(),
            });
        }
    };

    Ok((next, effects))
}

/// Re-enter Build, incrementing its retry counter; past the limit the run
/// aborts instead of looping.
fn retry_build(
    state: &PhaseState,
    max_retries: u32,
    why: &str,
) -> DomainResult<(PhaseState, Vec<Effect>)> {
    let attempted = state.retry_count(Phase::Build) + 1;
    if attempted > max_retries {
        let mut next = state.clone();
        next.phase = Phase::Aborted;
        let reason = "retry-limit-exceeded".to_string();
        return Ok((
            next,
            vec![
                Effect::EmitTransition {
                    from: state.phase,
                    to: Phase::Aborted,
                    retry_count: attempted,
                    trigger_reason: format!("{why}; retry limit {max_retries} exceeded"),
                },
                Effect::AbortRun { reason },
            ],
        ));
    }

    let mut next = state.clone();
    next.phase = Phase::Build;
    next.retries.insert(Phase::Build, attempted);
    Ok((
        next,
        vec![Effect::EmitTransition {
            from: state.phase,
            to: Phase::Build,
            retry_count: attempted,
            trigger_reason: format!("{why}; retrying build"),
        }],
    ))
}

fn abort(state: &PhaseState, reason: String) -> DomainResult<(PhaseState, Vec<Effect>)> {
    if state.phase.is_terminal() {
        return Err(DomainError::InvalidStateTransition {
            from: state.phase.to_string(),
            to: Phase::Aborted.to_string(),
            reason: "run already terminal".to_string(),
        });
    }
    let mut next = state.clone();
    next.phase = Phase::Aborted;
    Ok((
        next,
        vec![
            Effect::EmitTransition {
                from: state.phase,
                to: Phase::Aborted,
                retry_count: state.retry_count(Phase::Build),
                trigger_reason: reason.clone(),
            },
            Effect::AbortRun { reason },
        ],
    ))
}

fn emit(state: &PhaseState, to: Phase, retry_count: u32, trigger_reason: String) -> Effect {
    Effect::EmitTransition {
        from: state.phase,
        to,
        retry_count,
        trigger_reason,
    }
}
