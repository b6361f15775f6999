//! Convergence strategy tests driving the coordinator directly.

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use curia::domain::models::convergence::{ConflictResolution, ConvergenceStrategy};
use curia::domain::models::run::{PermissionMode, TaskRun};
use curia::domain::models::session::{AgentRole, SubagentOutcome, SubagentTask};
use curia::domain::models::RunConfig;
use curia::domain::ports::{SubagentRunner, TranscriptStore};
use curia::infrastructure::{InMemoryTranscriptStore, ScriptedRunner};
use curia::services::{OnFailure, SubagentCoordinator, TranscriptRecorder};
use curia::DomainError;

struct Harness {
    coordinator: SubagentCoordinator,
    recorder: Arc<TranscriptRecorder>,
    runner: Arc<ScriptedRunner>,
    run: TaskRun,
}

fn harness() -> Harness {
    let runner = Arc::new(ScriptedRunner::new());
    let recorder = Arc::new(TranscriptRecorder::new(
        Arc::new(InMemoryTranscriptStore::new()) as Arc<dyn TranscriptStore>,
    ));
    let coordinator = SubagentCoordinator::new(
        Arc::clone(&runner) as Arc<dyn SubagentRunner>,
        Arc::clone(&recorder),
        RunConfig::default(),
    );
    Harness {
        coordinator,
        recorder,
        runner,
        run: TaskRun::new("converge objective", None, PermissionMode::AcceptEdits),
    }
}

impl Harness {
    /// Spawn a session with a canned outcome and wait until it is terminal.
    /// Sibling discipline makes this sequential by construction.
    async fn spawn_terminal(&self, outcome: SubagentOutcome) -> Uuid {
        self.runner.push(AgentRole::Analyzer, outcome).await;
        let session = self
            .coordinator
            .delegate(
                &self.run,
                None,
                AgentRole::Analyzer,
                SubagentTask::new("subtask", PermissionMode::Plan).with_timeout(5),
                false,
            )
            .await
            .unwrap();
        // Failed sessions surface as a snapshot, not an error.
        let _ = self
            .coordinator
            .handoff(session.id, true, 5, OnFailure::Abort)
            .await
            .unwrap();
        session.id
    }
}

fn success(payload: Value) -> SubagentOutcome {
    SubagentOutcome::success(payload)
}

#[tokio::test]
async fn test_vote_majority_wins() {
    let h = harness();
    let s1 = h.spawn_terminal(success(json!({"answer": "A"}))).await;
    let s2 = h.spawn_terminal(success(json!({"answer": "A"}))).await;
    let s3 = h.spawn_terminal(success(json!({"answer": "B"}))).await;

    let result = h
        .coordinator
        .converge(
            &h.run,
            &[s1, s2, s3],
            ConvergenceStrategy::Vote,
            ConflictResolution::Manual,
        )
        .await
        .unwrap();

    assert_eq!(result.payload, json!({"answer": "A"}));
    assert!(result.conflicts.is_empty());
    assert!(result.resolution.is_none());
    assert_eq!(result.session_ids.len(), 3);
}

#[tokio::test]
async fn test_vote_tie_escalates_to_resolution() {
    let h = harness();
    let s1 = h.spawn_terminal(success(json!({"answer": "A"}))).await;
    let s2 = h.spawn_terminal(success(json!({"answer": "B"}))).await;
    let s3 = h.spawn_terminal(success(json!({"answer": "C"}))).await;

    // Manual resolution refuses to pick automatically.
    let err = h
        .coordinator
        .converge(
            &h.run,
            &[s1, s2, s3],
            ConvergenceStrategy::Vote,
            ConflictResolution::Manual,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::ManualReviewRequired(_)));

    // Auto-accept-latest picks the chronologically last contributor.
    let result = h
        .coordinator
        .converge(
            &h.run,
            &[s1, s2, s3],
            ConvergenceStrategy::Vote,
            ConflictResolution::AutoAcceptLatest,
        )
        .await
        .unwrap();
    assert_eq!(result.payload, json!({"answer": "C"}));
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.resolution, Some(ConflictResolution::AutoAcceptLatest));
}

#[tokio::test]
async fn test_vote_requires_three_sessions() {
    let h = harness();
    let s1 = h.spawn_terminal(success(json!("A"))).await;
    let s2 = h.spawn_terminal(success(json!("A"))).await;

    let err = h
        .coordinator
        .converge(
            &h.run,
            &[s1, s2],
            ConvergenceStrategy::Vote,
            ConflictResolution::Manual,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("at least 3"));
}

#[tokio::test]
async fn test_consensus_within_tolerance() {
    let h = harness();
    let s1 = h.spawn_terminal(success(json!({"score": 0.8000000}))).await;
    let s2 = h.spawn_terminal(success(json!({"score": 0.8000001}))).await;

    let result = h
        .coordinator
        .converge(
            &h.run,
            &[s1, s2],
            ConvergenceStrategy::Consensus,
            ConflictResolution::Manual,
        )
        .await
        .unwrap();
    assert_eq!(result.payload["score"], json!(0.8));
}

#[tokio::test]
async fn test_consensus_disagreement_yields_manual_review_only() {
    let h = harness();
    let s1 = h.spawn_terminal(success(json!({"score": 0.2}))).await;
    let s2 = h.spawn_terminal(success(json!({"score": 0.9}))).await;

    let err = h
        .coordinator
        .converge(
            &h.run,
            &[s1, s2],
            ConvergenceStrategy::Consensus,
            ConflictResolution::Manual,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::ManualReviewRequired(_)));

    // The manual-review signal is the sole outcome: there is a transcript
    // event for it and no convergence payload event.
    let events = h
        .recorder
        .read(h.run.id, curia::SequenceNumber(0))
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e.payload.get("manual_review_required").is_some()));
    assert!(!events.iter().any(|e| e.payload.get("convergence").is_some()));
}

#[tokio::test]
async fn test_merge_concatenates_disjoint_contributions() {
    let h = harness();
    let s1 = h.spawn_terminal(success(json!({"retries": "use backoff"}))).await;
    let s2 = h.spawn_terminal(success(json!({"timeouts": "bound every call"}))).await;

    let result = h
        .coordinator
        .converge(
            &h.run,
            &[s1, s2],
            ConvergenceStrategy::Merge,
            ConflictResolution::Manual,
        )
        .await
        .unwrap();
    assert_eq!(
        result.payload,
        json!({"retries": "use backoff", "timeouts": "bound every call"})
    );
    assert!(result.conflicts.is_empty());
}

#[tokio::test]
async fn test_merge_overlap_flags_conflict() {
    let h = harness();
    let s1 = h.spawn_terminal(success(json!({"retries": "three times"}))).await;
    let s2 = h.spawn_terminal(success(json!({"retries": "five times"}))).await;

    let err = h
        .coordinator
        .converge(
            &h.run,
            &[s1, s2],
            ConvergenceStrategy::Merge,
            ConflictResolution::Manual,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::ManualReviewRequired(_)));

    let result = h
        .coordinator
        .converge(
            &h.run,
            &[s1, s2],
            ConvergenceStrategy::Merge,
            ConflictResolution::AutoAcceptLatest,
        )
        .await
        .unwrap();
    assert_eq!(result.payload, json!({"retries": "five times"}));
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].target, "retries");
}

#[tokio::test]
async fn test_prefer_higher_confidence_needs_metadata() {
    let h = harness();
    let s1 = h
        .spawn_terminal(success(json!({"retries": "a"})).with_confidence(0.4))
        .await;
    let s2 = h.spawn_terminal(success(json!({"retries": "b"}))).await;

    let err = h
        .coordinator
        .converge(
            &h.run,
            &[s1, s2],
            ConvergenceStrategy::Merge,
            ConflictResolution::PreferHigherConfidence,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::MissingConfidenceMetadata(id) if id == s2));
}

#[tokio::test]
async fn test_prefer_higher_confidence_picks_winner() {
    let h = harness();
    let s1 = h
        .spawn_terminal(success(json!({"retries": "a"})).with_confidence(0.4))
        .await;
    let s2 = h
        .spawn_terminal(success(json!({"retries": "b"})).with_confidence(0.9))
        .await;

    let result = h
        .coordinator
        .converge(
            &h.run,
            &[s1, s2],
            ConvergenceStrategy::Merge,
            ConflictResolution::PreferHigherConfidence,
        )
        .await
        .unwrap();
    assert_eq!(result.payload, json!({"retries": "b"}));
}

#[tokio::test]
async fn test_first_success_ignores_failures() {
    let h = harness();
    let s1 = h
        .spawn_terminal(SubagentOutcome::failure(json!({"error": "x"})))
        .await;
    let s2 = h.spawn_terminal(success(json!({"winner": 2}))).await;
    let s3 = h.spawn_terminal(success(json!({"winner": 3}))).await;

    let result = h
        .coordinator
        .converge(
            &h.run,
            &[s1, s2, s3],
            ConvergenceStrategy::FirstSuccess,
            ConflictResolution::Manual,
        )
        .await
        .unwrap();

    // Chronologically first success wins; the failed session contributes
    // nothing but stays in the transcript.
    assert_eq!(result.payload, json!({"winner": 2}));
    assert_eq!(result.session_ids, vec![s2]);
}

#[tokio::test]
async fn test_non_first_success_rejects_failed_sessions() {
    let h = harness();
    let s1 = h
        .spawn_terminal(SubagentOutcome::failure(json!({"error": "x"})))
        .await;
    let s2 = h.spawn_terminal(success(json!({"a": 1}))).await;

    let err = h
        .coordinator
        .converge(
            &h.run,
            &[s1, s2],
            ConvergenceStrategy::Merge,
            ConflictResolution::Manual,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("only first_success"));
}

#[tokio::test]
async fn test_converge_requires_sessions() {
    let h = harness();
    let err = h
        .coordinator
        .converge(
            &h.run,
            &[],
            ConvergenceStrategy::Merge,
            ConflictResolution::Manual,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("at least one"));
}
