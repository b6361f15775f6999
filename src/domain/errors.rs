//! Domain errors for the skills loop.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::run::PermissionMode;

/// Domain-level errors.
///
/// Errors with a defined recovery path (retry, revise, re-read) are handled
/// inside the driver and coordinator and surfaced as transcript events;
/// everything else propagates to the run's terminal Aborted state.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Permission denied: {operation} requires {required}, run has {actual}")]
    PermissionDenied {
        operation: String,
        required: PermissionMode,
        actual: PermissionMode,
    },

    #[error("Permission escalation denied: requested {requested} exceeds parent {parent}")]
    PermissionEscalationDenied {
        requested: PermissionMode,
        parent: PermissionMode,
    },

    #[error("Version conflict on playbook key {key}")]
    VersionConflict { key: String },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Retry limit exceeded in {phase} after {retries} retries")]
    RetryLimitExceeded { phase: String, retries: u32 },

    #[error("Manual review required: {0}")]
    ManualReviewRequired(String),

    #[error("Subagent session timed out: {0}")]
    SubagentTimeout(Uuid),

    #[error("Convergence backlog: sibling session {0} has not reached a terminal state")]
    ConvergenceBacklog(Uuid),

    #[error("Delegation depth {depth} exceeds maximum {max}")]
    DelegationDepthExceeded { depth: u32, max: u32 },

    #[error("Missing confidence metadata on session {0}")]
    MissingConfidenceMetadata(Uuid),

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Invalid command for current state: {0}")]
    InvalidCommand(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Whether the error has a defined recovery path (§7 taxonomy); fatal
    /// errors abort the run.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::StorageUnavailable(_) | Self::RetryLimitExceeded { .. }
        )
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability_split() {
        assert!(!DomainError::StorageUnavailable("disk full".into()).is_recoverable());
        assert!(!DomainError::RetryLimitExceeded {
            phase: "build".into(),
            retries: 3
        }
        .is_recoverable());

        assert!(DomainError::VersionConflict { key: "k".into() }.is_recoverable());
        assert!(DomainError::ManualReviewRequired("tie".into()).is_recoverable());
        assert!(DomainError::SubagentTimeout(Uuid::new_v4()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = DomainError::PermissionEscalationDenied {
            requested: PermissionMode::BypassPermissions,
            parent: PermissionMode::Plan,
        };
        assert!(err.to_string().contains("bypass_permissions"));
        assert!(err.to_string().contains("plan"));
    }
}
