//! Closing summary artifact produced by the Document phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::delta::ProofBundle;
use super::run::PermissionMode;

/// Summary document generated after a Plan→Build→Test→Review→Document loop.
///
/// Recorded as the payload of the `run_finalized` transcript event and
/// exportable as markdown for release notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedCycleSummary {
    /// Run the summary documents.
    pub run_id: Uuid,
    /// Completion timestamp.
    pub completed_at: DateTime<Utc>,
    /// Proposals accepted by the governor.
    pub accepted_deltas: Vec<Uuid>,
    /// Proposals rejected by the governor.
    pub rejected_deltas: Vec<Uuid>,
    /// Proposals left undecided because governance was blocked.
    #[serde(default)]
    pub blocked_deltas: Vec<Uuid>,
    /// Proof bundles collected across test runs, in order.
    pub test_results: Vec<ProofBundle>,
    /// Permission modes used during the loop.
    pub permission_modes: Vec<PermissionMode>,
    /// Mapping of artifact labels to paths.
    pub artifact_links: Vec<(String, String)>,
}

impl ClosedCycleSummary {
    /// Render the human-readable markdown body.
    pub fn render_markdown(&self) -> String {
        let mut lines = vec![
            "# Closed Cycle Summary".to_string(),
            String::new(),
            format!("**Run**: {}", self.run_id),
            format!("**Completed**: {}", self.completed_at.to_rfc3339()),
            String::new(),
            "## Results".to_string(),
            String::new(),
            format!("- **Accepted Deltas**: {}", self.accepted_deltas.len()),
            format!("- **Rejected Deltas**: {}", self.rejected_deltas.len()),
            format!("- **Test Runs**: {}", self.test_results.len()),
            String::new(),
        ];

        if !self.accepted_deltas.is_empty() || !self.rejected_deltas.is_empty() {
            lines.push("## Deltas".to_string());
            lines.push(String::new());
            for id in &self.accepted_deltas {
                lines.push(format!("- `{id}` accepted"));
            }
            for id in &self.rejected_deltas {
                lines.push(format!("- `{id}` rejected"));
            }
            for id in &self.blocked_deltas {
                lines.push(format!("- `{id}` blocked (permission denied)"));
            }
            lines.push(String::new());
        }

        if !self.test_results.is_empty() {
            lines.push("## Test Results".to_string());
            lines.push(String::new());
            for (i, result) in self.test_results.iter().enumerate() {
                let status = if result.passed { "PASSED" } else { "FAILED" };
                lines.push(format!("### Test Run {} - {status}", i + 1));
                lines.push(String::new());
                lines.push(format!("- **Total Tests**: {}", result.total_tests));
                lines.push(format!("- **Failed Tests**: {}", result.failed_tests));
                lines.push(format!(
                    "- **Branch Coverage**: {:.1}%",
                    result.coverage_branch * 100.0
                ));
                lines.push(format!(
                    "- **Line Coverage**: {:.1}%",
                    result.coverage_lines * 100.0
                ));
                lines.push(format!(
                    "- **Duration**: {:.1}s",
                    result.duration_seconds
                ));
                lines.push(String::new());
            }
        }

        if !self.artifact_links.is_empty() {
            lines.push("## Artifacts".to_string());
            lines.push(String::new());
            for (label, path) in &self.artifact_links {
                lines.push(format!("- {label}: `{path}`"));
            }
            lines.push(String::new());
        }

        lines.join("\n")
    }
}
