//! Curia - Skills Loop Orchestrator
//!
//! Curia turns a high-level objective into a validated, auditable change to
//! a persistent playbook. One run moves through Plan→Build→Test→Review→
//! Document under a deterministic phase state machine; Build/Test delegate
//! work to subagent sessions; Review gates playbook mutation behind
//! verifiable proof; everything observable lands in an append-only
//! transcript that replays to the same terminal state.
//!
//! # Architecture
//!
//! This crate follows Clean Architecture / Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): Pure models, errors, and port traits
//! - **Service Layer** (`services`): The core components: transcript
//!   recorder, proof validator, delta governor, subagent coordinator, and
//!   the phase machine with its driver
//! - **Infrastructure Layer** (`infrastructure`): JSONL transcript store,
//!   SQLite playbook store, scripted runner, config and logging bootstrap
//! - **CLI Layer** (`cli`): Command-line interface

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    AgentRole, ClosedCycleSummary, Config, ConflictResolution, ConvergenceResult,
    ConvergenceStrategy, DeltaDecision, DeltaProposal, EventKind, PermissionMode, Phase,
    ProofBundle, RunConfig, RunOutcome, SequenceNumber, SessionState, SubagentOutcome,
    SubagentSession, TaskRun, TranscriptEvent,
};
pub use domain::ports::{PlaybookEntry, PlaybookStore, SubagentRunner, TranscriptStore};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    CompletedRun, DeltaGovernor, OnFailure, ProofValidator, RunDriver, RunMetrics,
    SubagentCoordinator, TranscriptRecorder,
};
