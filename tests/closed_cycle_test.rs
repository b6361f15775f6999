//! End-to-end closed-cycle tests: Plan→Build→Test→Review→Document driven by
//! a scripted runner against in-memory stores.

use std::sync::Arc;

use serde_json::json;

use curia::domain::models::event::{EventKind, SequenceNumber};
use curia::domain::models::run::{PermissionMode, Phase, RunOutcome};
use curia::domain::models::session::AgentRole;
use curia::domain::models::{DeltaProposal, RejectCategory, RunConfig};
use curia::domain::ports::{PlaybookStore, SubagentRunner, TranscriptStore};
use curia::infrastructure::{InMemoryPlaybookStore, InMemoryTranscriptStore, ScriptedRunner};
use curia::services::replay::replay;
use curia::services::{DeltaGovernor, RunDriver, SubagentCoordinator, TranscriptRecorder};
use curia::SubagentOutcome;

struct Harness {
    driver: RunDriver,
    recorder: Arc<TranscriptRecorder>,
    playbook: Arc<InMemoryPlaybookStore>,
    runner: Arc<ScriptedRunner>,
}

fn harness(config: RunConfig) -> Harness {
    let runner = Arc::new(ScriptedRunner::new());
    let playbook = Arc::new(InMemoryPlaybookStore::new());
    let recorder = Arc::new(TranscriptRecorder::new(
        Arc::new(InMemoryTranscriptStore::new()) as Arc<dyn TranscriptStore>,
    ));
    let governor = Arc::new(DeltaGovernor::new(
        Arc::clone(&playbook) as Arc<dyn PlaybookStore>,
        Arc::clone(&recorder),
        config.clone(),
    ));
    let coordinator = Arc::new(SubagentCoordinator::new(
        Arc::clone(&runner) as Arc<dyn SubagentRunner>,
        Arc::clone(&recorder),
        config.clone(),
    ));
    let driver = RunDriver::new(
        Arc::clone(&recorder),
        governor,
        coordinator,
        Arc::clone(&playbook) as Arc<dyn PlaybookStore>,
        config,
    );
    Harness {
        driver,
        recorder,
        playbook,
        runner,
    }
}

fn bundle(passed: bool, branch: f64, lines: f64) -> serde_json::Value {
    json!({
        "passed": passed,
        "coverage_branch": branch,
        "coverage_lines": lines,
        "total_tests": 12,
        "failed_tests": if passed { 0 } else { 2 },
        "artifacts": ["reports/test.json"],
        "mode": "full",
        "duration_seconds": 2.0,
        "report_path": "reports/test.json"
    })
}

/// The reference scenario: P1 fails the branch floor and is rejected, the
/// revision P2 passes and is accepted, and the summary references both.
#[tokio::test]
async fn test_reject_then_revise_then_accept() {
    let h = harness(RunConfig::default());

    h.runner
        .push(
            AgentRole::Analyzer,
            SubagentOutcome::success(json!({"plan": "add validation at the boundary"})),
        )
        .await;
    h.runner
        .push(
            AgentRole::Builder,
            SubagentOutcome::success(json!({"content": "validate inputs (draft)"})),
        )
        .await;
    h.runner
        .push(
            AgentRole::Tester,
            SubagentOutcome::success(bundle(true, 0.70, 0.90)),
        )
        .await;
    h.runner
        .push(
            AgentRole::Builder,
            SubagentOutcome::success(json!({"content": "validate inputs (hardened)"})),
        )
        .await;
    h.runner
        .push(
            AgentRole::Tester,
            SubagentOutcome::success(bundle(true, 0.85, 0.90)),
        )
        .await;

    let completed = h
        .driver
        .execute("add input validation", None, Some(PermissionMode::AcceptEdits))
        .await
        .unwrap();

    assert_eq!(completed.run.outcome, Some(RunOutcome::Complete));
    assert_eq!(completed.run.phase, Phase::Complete);

    let summary = completed.summary.expect("complete run has a summary");
    assert_eq!(summary.accepted_deltas.len(), 1);
    assert_eq!(summary.rejected_deltas.len(), 1);
    assert_eq!(summary.test_results.len(), 2);

    // The accepted revision landed in the playbook.
    let entry = h
        .playbook
        .read("add-input-validation")
        .await
        .unwrap()
        .expect("accepted delta mutates the playbook");
    assert_eq!(entry.entry.strategy, "validate inputs (hardened)");
    assert_eq!(entry.version, 1);

    // Transcript carries both proposals, with the revision linked to the
    // rejected ancestor.
    let events = h
        .recorder
        .read(completed.run.id, SequenceNumber(0))
        .await
        .unwrap();
    let proposals: Vec<DeltaProposal> = events
        .iter()
        .filter(|e| e.kind == EventKind::DeltaProposed)
        .map(|e| serde_json::from_value(e.payload.clone()).unwrap())
        .collect();
    let build_proposals: Vec<&DeltaProposal> = proposals
        .iter()
        .filter(|p| p.phase == Phase::Build)
        .collect();
    assert_eq!(build_proposals.len(), 2);
    assert_eq!(
        build_proposals[1].revision_of,
        Some(build_proposals[0].id),
        "revision links its rejected ancestor"
    );
    assert_eq!(summary.rejected_deltas[0], build_proposals[0].id);
    assert_eq!(summary.accepted_deltas[0], build_proposals[1].id);

    // The rejection category is test-failure.
    let replayed = replay(&events).unwrap();
    assert_eq!(
        replayed.decisions[&build_proposals[0].id].category(),
        Some(RejectCategory::TestFailure)
    );
    assert!(replayed.decisions[&build_proposals[1].id].is_accepted());
}

#[tokio::test]
async fn test_retry_limit_aborts_run() {
    let config = RunConfig {
        max_phase_retries: 3,
        ..RunConfig::default()
    };
    let h = harness(config);

    h.runner
        .push(AgentRole::Analyzer, SubagentOutcome::success(json!({"plan": "p"})))
        .await;
    // One initial attempt plus three retries, all failing in Test.
    for i in 0..4 {
        h.runner
            .push(
                AgentRole::Builder,
                SubagentOutcome::success(json!({"content": format!("attempt {i}")})),
            )
            .await;
        h.runner
            .push(
                AgentRole::Tester,
                SubagentOutcome::success(bundle(false, 0.9, 0.9)),
            )
            .await;
    }

    let completed = h
        .driver
        .execute("flaky objective", None, Some(PermissionMode::AcceptEdits))
        .await
        .unwrap();

    assert_eq!(completed.run.phase, Phase::Aborted);
    assert_eq!(
        completed.run.outcome,
        Some(RunOutcome::Aborted {
            reason: "retry-limit-exceeded".to_string()
        })
    );
    // Nothing accepted, playbook untouched.
    assert!(h.playbook.keys().await.unwrap().is_empty());

    // The transcript shows the retry climb then the abort.
    let events = h
        .recorder
        .read(completed.run.id, SequenceNumber(0))
        .await
        .unwrap();
    let replayed = replay(&events).unwrap();
    assert_eq!(replayed.final_phase, Some(Phase::Aborted));
    assert!(replayed.retries.get(&Phase::Build).copied().unwrap_or(0) >= 3);
}

#[tokio::test]
async fn test_read_only_run_blocks_governance_but_completes() {
    let h = harness(RunConfig::default());

    h.runner
        .push(AgentRole::Analyzer, SubagentOutcome::success(json!({"plan": "p"})))
        .await;
    h.runner
        .push(
            AgentRole::Builder,
            SubagentOutcome::success(json!({"content": "strategy"})),
        )
        .await;
    h.runner
        .push(
            AgentRole::Tester,
            SubagentOutcome::success(bundle(true, 0.9, 0.9)),
        )
        .await;

    let completed = h
        .driver
        .execute("read only objective", None, Some(PermissionMode::Plan))
        .await
        .unwrap();

    // The blocked governor call does not affect the terminal outcome.
    assert_eq!(completed.run.outcome, Some(RunOutcome::Complete));
    let summary = completed.summary.unwrap();
    assert_eq!(summary.blocked_deltas.len(), 1);
    assert!(summary.accepted_deltas.is_empty());
    assert!(h.playbook.keys().await.unwrap().is_empty());

    // The blocked operation is in the transcript.
    let events = h
        .recorder
        .read(completed.run.id, SequenceNumber(0))
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e.payload.get("blocked_operation").is_some()));
}

#[tokio::test]
async fn test_builder_failure_aborts() {
    let h = harness(RunConfig::default());

    h.runner
        .push(AgentRole::Analyzer, SubagentOutcome::success(json!({"plan": "p"})))
        .await;
    h.runner
        .push(
            AgentRole::Builder,
            SubagentOutcome::failure(json!({"error": "toolchain exploded"})),
        )
        .await;

    let completed = h
        .driver
        .execute("doomed objective", None, Some(PermissionMode::AcceptEdits))
        .await
        .unwrap();

    assert_eq!(completed.run.phase, Phase::Aborted);
    assert!(completed.summary.is_none());
    match completed.run.outcome {
        Some(RunOutcome::Aborted { ref reason }) => {
            assert!(reason.contains("build failed"), "reason: {reason}");
        }
        other => panic!("expected abort, got {other:?}"),
    }
}

#[tokio::test]
async fn test_accepted_deltas_survive_later_failures() {
    // First run accepts a delta; a second failing run must not roll it back.
    let h = harness(RunConfig::default());

    h.runner
        .push(AgentRole::Analyzer, SubagentOutcome::success(json!({"plan": "p"})))
        .await;
    h.runner
        .push(
            AgentRole::Builder,
            SubagentOutcome::success(json!({"content": "keep me"})),
        )
        .await;
    h.runner
        .push(
            AgentRole::Tester,
            SubagentOutcome::success(bundle(true, 0.9, 0.9)),
        )
        .await;

    let first = h
        .driver
        .execute("first objective", None, Some(PermissionMode::AcceptEdits))
        .await
        .unwrap();
    assert_eq!(first.run.outcome, Some(RunOutcome::Complete));

    h.runner
        .push(AgentRole::Analyzer, SubagentOutcome::success(json!({"plan": "p"})))
        .await;
    h.runner
        .push(
            AgentRole::Builder,
            SubagentOutcome::failure(json!({"error": "nope"})),
        )
        .await;
    let second = h
        .driver
        .execute("second objective", None, Some(PermissionMode::AcceptEdits))
        .await
        .unwrap();
    assert_eq!(second.run.phase, Phase::Aborted);

    let entry = h.playbook.read("first-objective").await.unwrap().unwrap();
    assert_eq!(entry.entry.strategy, "keep me");
}
