//! Subagent execution port.
//!
//! The actual agent transport (model invocation, streaming) lives outside
//! the core; the coordinator only sees this trait.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::session::{AgentRole, SubagentOutcome, SubagentTask};

/// Error type for subagent execution.
#[derive(Debug, Error)]
pub enum SubagentRunnerError {
    #[error("Subagent execution failed: {0}")]
    ExecutionFailed(String),

    #[error("No scripted outcome remaining for role {0}")]
    ScriptExhausted(String),
}

/// Executes one delegated subtask to completion.
///
/// Implementations must be cancel-safe: the coordinator races `run` against
/// the session timeout and drops the future on expiry.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    async fn run(
        &self,
        role: AgentRole,
        task: &SubagentTask,
    ) -> Result<SubagentOutcome, SubagentRunnerError>;
}
