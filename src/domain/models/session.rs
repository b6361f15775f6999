//! Subagent session domain models.
//!
//! A `SubagentSession` is a child execution context delegated a bounded
//! subtask. Sessions live in an explicit registry keyed by session id with
//! `parent_session_id` back-references; lookups traverse the registry rather
//! than following live references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::run::PermissionMode;

/// Fixed set of delegated agent roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Builder,
    Tester,
    Analyzer,
    Retriever,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Builder => "builder",
            Self::Tester => "tester",
            Self::Analyzer => "analyzer",
            Self::Retriever => "retriever",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "builder" => Some(Self::Builder),
            "tester" => Some(Self::Tester),
            "analyzer" => Some(Self::Analyzer),
            "retriever" => Some(Self::Retriever),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle: Spawned → Active → {Converged | Failed | TimedOut}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered but the task has not started executing.
    Spawned,
    /// Task running.
    Active,
    /// Terminal success; the session's outcome is eligible for convergence.
    Converged,
    /// Terminal failure.
    Failed,
    /// Terminal timeout.
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::Failed | Self::TimedOut)
    }

    /// Terminal and successful.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Converged)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawned => "spawned",
            Self::Active => "active",
            Self::Converged => "converged",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded subtask handed to a delegated agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentTask {
    /// What the agent is asked to do.
    pub description: String,
    /// Inherited context snapshot (playbook summary, prior findings).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_snapshot: Option<String>,
    /// Permission scope for the child; must not exceed the parent's.
    pub permission_mode: PermissionMode,
    /// Per-session execution deadline.
    pub timeout_seconds: u64,
}

impl SubagentTask {
    pub fn new(description: impl Into<String>, permission_mode: PermissionMode) -> Self {
        Self {
            description: description.into(),
            context_snapshot: None,
            permission_mode,
            timeout_seconds: 300,
        }
    }

    pub fn with_context(mut self, snapshot: impl Into<String>) -> Self {
        self.context_snapshot = Some(snapshot.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Structured outcome returned by a delegated agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentOutcome {
    /// Whether the agent considers the subtask done.
    pub success: bool,
    /// Result payload; object payloads are treated as per-target
    /// contributions during merge convergence.
    pub payload: Value,
    /// Optional confidence score in 0.0..=1.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// References to produced artifacts.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl SubagentOutcome {
    pub fn success(payload: Value) -> Self {
        Self {
            success: true,
            payload,
            confidence: None,
            artifacts: Vec::new(),
        }
    }

    pub fn failure(payload: Value) -> Self {
        Self {
            success: false,
            payload,
            confidence: None,
            artifacts: Vec::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// A child execution context delegated by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentSession {
    /// Session identifier.
    pub id: Uuid,
    /// Owning run; a session never outlives its run.
    pub run_id: Uuid,
    /// Registry back-reference to the delegating session, if nested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<Uuid>,
    /// Role the session plays.
    pub role: AgentRole,
    /// Delegated task.
    pub task: SubagentTask,
    /// Lifecycle state.
    pub state: SessionState,
    /// Whether the parent's context snapshot was inherited.
    pub inherit_context: bool,
    /// Forked sessions are terminal experimentation branches; they never
    /// converge back and are exempt from sibling discipline.
    pub forked: bool,
    /// Nesting depth below the run (direct delegations are depth 1).
    pub depth: u32,
    /// Spawn timestamp.
    pub spawned_at: DateTime<Utc>,
    /// Terminal timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Outcome, present once the session reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SubagentOutcome>,
}

impl SubagentSession {
    pub fn new(
        run_id: Uuid,
        parent_session_id: Option<Uuid>,
        role: AgentRole,
        task: SubagentTask,
        inherit_context: bool,
        depth: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            parent_session_id,
            role,
            task,
            state: SessionState::Spawned,
            inherit_context,
            forked: false,
            depth,
            spawned_at: Utc::now(),
            finished_at: None,
            outcome: None,
        }
    }
}

/// Static definition of an agent role: what it does and which tools it may
/// touch. The registry mirrors the subagent definitions handed to the
/// execution transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub role: AgentRole,
    pub description: String,
    pub allowed_tools: Vec<String>,
    pub default_permission: PermissionMode,
}

/// Default role definitions for the four delegated roles.
pub fn default_role_definitions() -> Vec<RoleDefinition> {
    vec![
        RoleDefinition {
            role: AgentRole::Builder,
            description: "Implement the planned change and emit a delta proposal.".to_string(),
            allowed_tools: vec!["fs.read".to_string(), "fs.write".to_string()],
            default_permission: PermissionMode::AcceptEdits,
        },
        RoleDefinition {
            role: AgentRole::Tester,
            description: "Execute the verification suite and report a proof bundle.".to_string(),
            allowed_tools: vec!["fs.read".to_string(), "test.run".to_string()],
            default_permission: PermissionMode::Plan,
        },
        RoleDefinition {
            role: AgentRole::Analyzer,
            description: "Analyze the playbook and objective into a concrete plan.".to_string(),
            allowed_tools: vec!["fs.read".to_string()],
            default_permission: PermissionMode::Plan,
        },
        RoleDefinition {
            role: AgentRole::Retriever,
            description: "Fetch supporting context for the active phase.".to_string(),
            allowed_tools: vec!["fs.read".to_string()],
            default_permission: PermissionMode::Plan,
        },
    ]
}
