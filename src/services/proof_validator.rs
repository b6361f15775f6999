//! Proof validator service.
//!
//! Evaluates whether a proposal's evidence meets the configured thresholds.
//! The decision is deterministic and context-free: validating the same
//! inputs twice yields the same verdict, and nothing is mutated.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::models::delta::{DeltaProposal, ProofMode};

/// Rounding epsilon applied before threshold comparison so representation
/// error in the coverage ratios cannot cause spurious failures.
const RATIO_EPSILON: f64 = 1e-9;

/// Outcome of proof validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofVerdict {
    pub passed: bool,
    /// Human-readable reasons for a failing verdict; empty on pass.
    pub reasons: Vec<String>,
}

impl ProofVerdict {
    fn pass() -> Self {
        Self {
            passed: true,
            reasons: Vec::new(),
        }
    }

    fn fail(reasons: Vec<String>) -> Self {
        Self {
            passed: false,
            reasons,
        }
    }
}

/// Stateless evidence checker for delta proposals.
#[derive(Debug, Clone, Default)]
pub struct ProofValidator;

impl ProofValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a proposal's evidence against named ratio floors.
    ///
    /// Policy for `requires_proof` proposals: a missing bundle fails; a
    /// degraded-mode bundle fails unless `allow_degraded` is set (the caller
    /// is responsible for logging that override); failing tests fail; any
    /// ratio below its floor (inclusive, compared after epsilon rounding)
    /// fails. Proposals without the tag always pass.
    pub fn validate(
        &self,
        proposal: &DeltaProposal,
        thresholds: &BTreeMap<String, f64>,
        allow_degraded: bool,
    ) -> ProofVerdict {
        if !proposal.requires_proof() {
            return ProofVerdict::pass();
        }

        let Some(bundle) = proposal.proof.as_ref() else {
            return ProofVerdict::fail(vec!["proof bundle is absent".to_string()]);
        };

        let mut reasons = Vec::new();

        if bundle.mode == ProofMode::Degraded && !allow_degraded {
            reasons.push("proof bundle is degraded and no override is set".to_string());
        }

        if !bundle.passed {
            reasons.push(format!(
                "tests failed: {}/{} failures",
                bundle.failed_tests, bundle.total_tests
            ));
        }

        for (name, floor) in thresholds {
            match bundle.ratio(name) {
                Some(ratio) if ratio + RATIO_EPSILON >= *floor => {}
                Some(ratio) => reasons.push(format!(
                    "{name} coverage {ratio:.4} below floor {floor:.4}"
                )),
                None => reasons.push(format!("{name} coverage is not reported")),
            }
        }

        if reasons.is_empty() {
            ProofVerdict::pass()
        } else {
            ProofVerdict::fail(reasons)
        }
    }
}
