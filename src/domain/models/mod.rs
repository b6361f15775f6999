//! Domain models for the skills loop.

pub mod config;
pub mod convergence;
pub mod delta;
pub mod event;
pub mod run;
pub mod session;
pub mod summary;

pub use config::{Config, DatabaseConfig, LoggingConfig, RunConfig, TranscriptConfig};
pub use convergence::{
    values_match, Conflict, ConflictResolution, ConvergenceResult, ConvergenceStrategy,
};
pub use delta::{
    DeltaDecision, DeltaOp, DeltaProposal, ProofBundle, ProofMode, RejectCategory,
    REQUIRES_PROOF_TAG,
};
pub use event::{
    EventDraft, EventKind, PhaseTransitionPayload, SequenceNumber, TranscriptEvent,
};
pub use run::{slugify, DeltaInput, DeltaSource, PermissionMode, Phase, RunOutcome, TaskRun};
pub use session::{
    default_role_definitions, AgentRole, RoleDefinition, SessionState, SubagentOutcome,
    SubagentSession, SubagentTask,
};
pub use summary::ClosedCycleSummary;
