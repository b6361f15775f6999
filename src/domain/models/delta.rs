//! Delta proposal and proof bundle domain models.
//!
//! A `DeltaProposal` is a candidate addition, update, or removal against the
//! playbook. Proposals are terminated exactly once by the governor; a
//! rejection may spawn a revised proposal but never reopens the old one.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::Phase;

/// Tag marking a proposal that cannot be accepted without a full proof bundle.
pub const REQUIRES_PROOF_TAG: &str = "requires_proof";

/// The kind of playbook change a proposal carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOp {
    /// Insert a new entry at the target key.
    #[default]
    Add,
    /// Replace the entry at the target key.
    Update,
    /// Remove the entry at the target key.
    Remove,
}

impl DeltaOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Remove => "remove",
        }
    }
}

/// Whether the attached evidence came from a real verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProofMode {
    /// Full test execution with coverage tracking.
    #[default]
    Full,
    /// Dry-run or otherwise degraded fallback; not acceptable as proof
    /// without an explicit, logged override.
    Degraded,
}

/// Evidence attached to a delta proposal to justify acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofBundle {
    /// Whether all tests passed.
    pub passed: bool,
    /// Branch coverage ratio in 0.0..=1.0.
    #[serde(default)]
    pub coverage_branch: f64,
    /// Line coverage ratio in 0.0..=1.0.
    #[serde(default)]
    pub coverage_lines: f64,
    /// Total tests executed.
    #[serde(default)]
    pub total_tests: u32,
    /// Failing test count.
    #[serde(default)]
    pub failed_tests: u32,
    /// References to produced artifacts (report files, logs).
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Full verification run vs. degraded fallback.
    #[serde(default)]
    pub mode: ProofMode,
    /// Truncated stderr for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_summary: Option<String>,
    /// Wall-clock duration of the verification run.
    #[serde(default)]
    pub duration_seconds: f64,
    /// Path to a machine-readable test report, when produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
}

impl ProofBundle {
    /// Coverage ratio for a named metric, `None` when the metric is unknown.
    pub fn ratio(&self, name: &str) -> Option<f64> {
        match name {
            "branch" => Some(self.coverage_branch),
            "lines" => Some(self.coverage_lines),
            _ => None,
        }
    }

    /// A degraded placeholder bundle for dry runs.
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            coverage_branch: 0.0,
            coverage_lines: 0.0,
            total_tests: 0,
            failed_tests: 0,
            artifacts: Vec::new(),
            mode: ProofMode::Degraded,
            stderr_summary: Some(reason.into()),
            duration_seconds: 0.0,
            report_path: None,
        }
    }
}

/// Closed set of governor rejection categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCategory {
    InsufficientEvidence,
    TestFailure,
    ConflictsWithExisting,
    LowConfidence,
    Other,
}

impl RejectCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientEvidence => "insufficient_evidence",
            Self::TestFailure => "test_failure",
            Self::ConflictsWithExisting => "conflicts_with_existing",
            Self::LowConfidence => "low_confidence",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for RejectCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal decision for a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DeltaDecision {
    Accepted {
        rationale: String,
    },
    Rejected {
        category: RejectCategory,
        rationale: String,
    },
}

impl DeltaDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    /// Rejection category, when rejected.
    pub fn category(&self) -> Option<RejectCategory> {
        match self {
            Self::Accepted { .. } => None,
            Self::Rejected { category, .. } => Some(*category),
        }
    }
}

/// A candidate change to the playbook awaiting a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaProposal {
    /// Proposal identifier.
    pub id: Uuid,
    /// Run that produced the proposal.
    pub run_id: Uuid,
    /// Phase that originated the proposal.
    pub phase: Phase,
    /// Kind of change.
    #[serde(default)]
    pub op: DeltaOp,
    /// Playbook key the change targets.
    pub target_key: String,
    /// Proposed entry content (strategy text); empty for removals.
    pub content: String,
    /// Explanation for the change.
    pub rationale: String,
    /// Free-form tags; `requires_proof` gates acceptance on evidence.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Optional confidence score supplied by the originating agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Evidence bundle, attached during the Test phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<ProofBundle>,
    /// Proposal this one revises, for rejected ancestors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_of: Option<Uuid>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl DeltaProposal {
    pub fn new(
        run_id: Uuid,
        phase: Phase,
        op: DeltaOp,
        target_key: impl Into<String>,
        content: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            phase,
            op,
            target_key: target_key.into(),
            content: content.into(),
            rationale: rationale.into(),
            tags: BTreeSet::new(),
            confidence: None,
            proof: None,
            revision_of: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_proof(mut self, proof: ProofBundle) -> Self {
        self.proof = Some(proof);
        self
    }

    /// Whether acceptance must be gated on a full proof bundle.
    pub fn requires_proof(&self) -> bool {
        self.tags.contains(REQUIRES_PROOF_TAG)
    }

    /// Spawn a fresh revised proposal. The rejected ancestor is left
    /// untouched; the revision gets a new identifier and no proof.
    pub fn revise(&self, content: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: self.run_id,
            phase: self.phase,
            op: self.op,
            target_key: self.target_key.clone(),
            content: content.into(),
            rationale: rationale.into(),
            tags: self.tags.clone(),
            confidence: None,
            proof: None,
            revision_of: Some(self.id),
            created_at: Utc::now(),
        }
    }
}
