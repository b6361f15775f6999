//! Command surface validation.
//!
//! The thin layer in front of the core: every external command is validated
//! against the run's current phase and permission state before being
//! forwarded. Invalid commands are rejected with a descriptive error and do
//! not advance any state.

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::run::{Phase, TaskRun};

/// External commands accepted while a run is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    AcceptDelta,
    RejectDelta,
    Delegate,
    Handoff,
    Converge,
    Fork,
    Document,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcceptDelta => "accept-delta",
            Self::RejectDelta => "reject-delta",
            Self::Delegate => "delegate",
            Self::Handoff => "handoff",
            Self::Converge => "converge",
            Self::Fork => "fork",
            Self::Document => "document",
        }
    }

    /// Phases in which the command may be forwarded into the core.
    fn valid_phases(&self) -> &'static [Phase] {
        match self {
            Self::AcceptDelta | Self::RejectDelta => &[Phase::Review],
            Self::Delegate | Self::Handoff | Self::Converge | Self::Fork => {
                &[Phase::Plan, Phase::Build, Phase::Test]
            }
            Self::Document => &[Phase::Review, Phase::Document],
        }
    }

    /// Whether the command mutates the playbook and therefore needs a
    /// mutating permission mode.
    fn needs_mutation(&self) -> bool {
        matches!(self, Self::AcceptDelta)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a command against the run's phase and permission state.
pub fn validate(command: Command, run: &TaskRun) -> DomainResult<()> {
    if run.is_terminal() {
        return Err(DomainError::InvalidCommand(format!(
            "{command} rejected: run {} is already terminal",
            run.id
        )));
    }

    if !command.valid_phases().contains(&run.phase) {
        return Err(DomainError::InvalidCommand(format!(
            "{command} is not valid in phase {}; valid phases: {}",
            run.phase,
            command
                .valid_phases()
                .iter()
                .map(Phase::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    if command.needs_mutation() && !run.permission_mode.allows_mutation() {
        return Err(DomainError::InvalidCommand(format!(
            "{command} requires a mutating permission mode; run has {}",
            run.permission_mode
        )));
    }

    Ok(())
}
