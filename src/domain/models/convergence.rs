//! Convergence domain models.
//!
//! Strategy and conflict-resolution selection are closed tagged-variant
//! dispatch: one case per behavior, exhaustively checkable at compile time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// How multiple subagent results are reconciled into one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStrategy {
    /// Concatenate non-overlapping contributions; overlaps become conflicts.
    Merge,
    /// Strict majority among ≥3 sessions; ties escalate to resolution.
    Vote,
    /// All results must match within tolerance; any disagreement rejects the
    /// convergence outright.
    Consensus,
    /// Chronologically first successful session wins; the rest are discarded
    /// but retained in the transcript.
    FirstSuccess,
}

impl ConvergenceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Vote => "vote",
            Self::Consensus => "consensus",
            Self::FirstSuccess => "first_success",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "merge" => Some(Self::Merge),
            "vote" => Some(Self::Vote),
            "consensus" => Some(Self::Consensus),
            "first_success" | "first-success" => Some(Self::FirstSuccess),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConvergenceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How conflicting contributions are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// No automatic output; conflicts are flagged for external review.
    Manual,
    /// Latest terminal timestamp wins; equal timestamps break on lexical
    /// session-id order.
    AutoAcceptLatest,
    /// Highest confidence wins; every contributor must carry confidence
    /// metadata.
    PreferHigherConfidence,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::AutoAcceptLatest => "auto_accept_latest",
            Self::PreferHigherConfidence => "prefer_higher_confidence",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "manual" => Some(Self::Manual),
            "auto_accept_latest" | "auto-accept-latest" => Some(Self::AutoAcceptLatest),
            "prefer_higher_confidence" | "prefer-higher-confidence" => {
                Some(Self::PreferHigherConfidence)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overlapping contributions detected on a single target during merge, or a
/// tied vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Target key (or `"vote"` for a tied ballot).
    pub target: String,
    /// Sessions contributing conflicting values.
    pub session_ids: Vec<Uuid>,
}

/// Outcome of reconciling one or more subagent sessions. Created once per
/// convergence call and immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceResult {
    /// Strategy that produced the result.
    pub strategy: ConvergenceStrategy,
    /// Contributing session identifiers.
    pub session_ids: Vec<Uuid>,
    /// Conflicts detected along the way (resolved or not).
    pub conflicts: Vec<Conflict>,
    /// Resolution method applied when conflicts arose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
    /// Final merged payload.
    pub payload: Value,
}

/// Compare two JSON values with a numeric tolerance on leaves.
///
/// Non-numeric leaves compare by equality; arrays and objects compare
/// structurally. Used by consensus convergence, where floating-point results
/// from independent sessions may differ by representation error.
pub fn values_match(a: &Value, b: &Value, tolerance: f64) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() <= tolerance,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys.iter())
                    .all(|(x, y)| values_match(x, y, tolerance))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            if xs.len() != ys.len() {
                return false;
            }
            let ys: BTreeMap<_, _> = ys.iter().collect();
            xs.iter().all(|(k, x)| {
                ys.get(k)
                    .is_some_and(|y| values_match(x, y, tolerance))
            })
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strategy_roundtrip() {
        for strategy in [
            ConvergenceStrategy::Merge,
            ConvergenceStrategy::Vote,
            ConvergenceStrategy::Consensus,
            ConvergenceStrategy::FirstSuccess,
        ] {
            assert_eq!(
                ConvergenceStrategy::from_str(strategy.as_str()),
                Some(strategy)
            );
        }
    }

    #[test]
    fn test_resolution_roundtrip() {
        for resolution in [
            ConflictResolution::Manual,
            ConflictResolution::AutoAcceptLatest,
            ConflictResolution::PreferHigherConfidence,
        ] {
            assert_eq!(
                ConflictResolution::from_str(resolution.as_str()),
                Some(resolution)
            );
        }
    }

    #[test]
    fn test_values_match_numeric_tolerance() {
        assert!(values_match(&json!(0.1), &json!(0.100000001), 1e-6));
        assert!(!values_match(&json!(0.1), &json!(0.2), 1e-6));
        assert!(values_match(
            &json!({"score": 1.0, "label": "ok"}),
            &json!({"score": 1.0000001, "label": "ok"}),
            1e-3
        ));
        assert!(!values_match(
            &json!({"label": "ok"}),
            &json!({"label": "different"}),
            1e-3
        ));
    }

    #[test_strategy::proptest]
    fn prop_values_match_is_reflexive(#[strategy(-1.0e6..1.0e6f64)] x: f64) {
        assert!(values_match(&json!(x), &json!(x), 0.0));
        assert!(values_match(&json!([x, "label"]), &json!([x, "label"]), 0.0));
    }

    #[test]
    fn test_values_match_structure() {
        assert!(values_match(&json!([1, 2]), &json!([1, 2]), 0.0));
        assert!(!values_match(&json!([1, 2]), &json!([1, 2, 3]), 0.0));
        assert!(!values_match(&json!({"a": 1}), &json!({"a": 1, "b": 2}), 0.0));
        assert!(!values_match(&json!("x"), &json!(1), 0.0));
    }
}
