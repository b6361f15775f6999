//! Task run domain model.
//!
//! A `TaskRun` is one end-to-end execution of the skills loop: an objective
//! enters at Plan and leaves the loop in exactly one terminal state. The run
//! is owned by the driver; phase transitions are the only mutations, and a
//! terminal run is never modified again.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One stage of the Plan→Build→Test→Review→Document loop, plus the two
/// terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Build,
    Test,
    Review,
    Document,
    /// Terminal success.
    Complete,
    /// Terminal failure with a structured reason on the run.
    Aborted,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Build => "build",
            Self::Test => "test",
            Self::Review => "review",
            Self::Document => "document",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plan" => Some(Self::Plan),
            "build" => Some(Self::Build),
            "test" => Some(Self::Test),
            "review" => Some(Self::Review),
            "document" => Some(Self::Document),
            "complete" => Some(Self::Complete),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Whether the run can no longer advance from this phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission level for a run or subagent session.
///
/// Totally ordered: `Plan < AcceptEdits < BypassPermissions`. Playbook
/// mutation requires at least `AcceptEdits`; a child session must not exceed
/// its parent's mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Read-only planning and research; no mutations permitted.
    #[default]
    Plan,
    /// Edits and playbook mutations permitted.
    AcceptEdits,
    /// All operations permitted without further gating.
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::AcceptEdits => "accept_edits",
            Self::BypassPermissions => "bypass_permissions",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plan" => Some(Self::Plan),
            "accept_edits" | "accept-edits" => Some(Self::AcceptEdits),
            "bypass_permissions" | "bypass-permissions" => Some(Self::BypassPermissions),
            _ => None,
        }
    }

    /// Whether this mode is allowed to mutate the playbook.
    pub fn allows_mutation(&self) -> bool {
        *self >= Self::AcceptEdits
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a curator-supplied delta input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaSource {
    /// A pending delta produced by a previous curation pass.
    Delta,
    /// A detected playbook gap.
    Gap,
    /// Manually filed by an operator.
    Manual,
}

/// A pending playbook change or gap that seeds a run.
///
/// Links the run back to the curation queue entry it is implementing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaInput {
    /// Unique identifier for this delta in the curation queue.
    pub delta_id: String,
    /// Curator's explanation for the delta.
    pub rationale: String,
    /// Playbook section targeted by the delta.
    pub playbook_section: String,
    /// Origin of this input.
    pub source: DeltaSource,
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Complete,
    Aborted { reason: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// One end-to-end execution of the skills loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    /// Unique run identifier.
    pub id: Uuid,
    /// High-level objective driving the run.
    pub objective: String,
    /// Optional curation-queue entry that seeded the run.
    pub delta_input: Option<DeltaInput>,
    /// Current phase.
    pub phase: Phase,
    /// Retry counter per re-entered phase.
    pub retries: BTreeMap<Phase, u32>,
    /// Permission level for the whole run.
    pub permission_mode: PermissionMode,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Completion timestamp, set exactly once at finalization.
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal outcome, set exactly once at finalization.
    pub outcome: Option<RunOutcome>,
}

impl TaskRun {
    /// Create a new run in the Plan phase.
    pub fn new(
        objective: impl Into<String>,
        delta_input: Option<DeltaInput>,
        permission_mode: PermissionMode,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            objective: objective.into(),
            delta_input,
            phase: Phase::Plan,
            retries: BTreeMap::new(),
            permission_mode,
            created_at: Utc::now(),
            completed_at: None,
            outcome: None,
        }
    }

    /// Retry count recorded for a phase.
    pub fn retry_count(&self, phase: Phase) -> u32 {
        self.retries.get(&phase).copied().unwrap_or(0)
    }

    /// Whether the run has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// The playbook key this run targets: the seeded section when present,
    /// otherwise a slug derived from the objective.
    pub fn target_key(&self) -> String {
        self.delta_input
            .as_ref()
            .map_or_else(|| slugify(&self.objective), |d| d.playbook_section.clone())
    }

    /// Finalize the run. Idempotent on repeated calls with the same outcome;
    /// the first finalization wins.
    pub fn finalize(&mut self, outcome: RunOutcome) {
        if self.outcome.is_some() {
            return;
        }
        self.phase = match outcome {
            RunOutcome::Complete => Phase::Complete,
            RunOutcome::Aborted { .. } => Phase::Aborted,
        };
        self.outcome = Some(outcome);
        self.completed_at = Some(Utc::now());
    }
}

/// Lowercase, hyphen-separated key derived from free text.
pub fn slugify(text: &str) -> String {
    let slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let parts: Vec<&str> = slug.split('-').filter(|p| !p.is_empty()).collect();
    parts.join("-")
}
