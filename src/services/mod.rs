//! Service layer: the five core components of the skills loop plus replay
//! and metrics derived from the transcript.

pub mod command_surface;
pub mod delta_governor;
pub mod metrics;
pub mod phase_machine;
pub mod proof_validator;
pub mod replay;
pub mod run_driver;
pub mod subagent_coordinator;
pub mod transcript_recorder;

pub use command_surface::Command;
pub use delta_governor::DeltaGovernor;
pub use metrics::RunMetrics;
pub use phase_machine::{transition, Effect, PhaseEvent, PhaseState};
pub use proof_validator::{ProofValidator, ProofVerdict};
pub use replay::{replay, ReplayedRun};
pub use run_driver::{CompletedRun, RunDriver};
pub use subagent_coordinator::{OnFailure, SubagentCoordinator};
pub use transcript_recorder::TranscriptRecorder;
