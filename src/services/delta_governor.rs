//! Delta governor service.
//!
//! The single gate in front of the playbook: nothing mutates the knowledge
//! base except this service, and only after proof validation. Accepted
//! mutations happen exactly once; rejections leave the playbook untouched
//! and record a category. Concurrent accepts against the same key are
//! serialized by an in-flight key registry, so a later-arriving proposal is
//! rejected rather than silently overwriting.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::delta::{
    DeltaDecision, DeltaOp, DeltaProposal, ProofMode, RejectCategory,
};
use crate::domain::models::event::{EventDraft, EventKind};
use crate::domain::models::run::TaskRun;
use crate::domain::models::RunConfig;
use crate::domain::ports::{PlaybookEntry, PlaybookError, PlaybookStore};
use crate::services::proof_validator::ProofValidator;
use crate::services::transcript_recorder::TranscriptRecorder;

/// Applies accept/reject decisions to the playbook under the proof contract.
pub struct DeltaGovernor {
    playbook: Arc<dyn PlaybookStore>,
    recorder: Arc<TranscriptRecorder>,
    validator: ProofValidator,
    config: RunConfig,
    /// Keys with an accept currently in flight.
    in_flight: Mutex<HashSet<String>>,
}

impl DeltaGovernor {
    pub fn new(
        playbook: Arc<dyn PlaybookStore>,
        recorder: Arc<TranscriptRecorder>,
        config: RunConfig,
    ) -> Self {
        Self {
            playbook,
            recorder,
            validator: ProofValidator::new(),
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Decide a proposal.
    ///
    /// Returns the decision, which is also recorded as a `delta_decided`
    /// transcript event. Fails with `PermissionDenied` (logged as a blocked
    /// operation, run unaffected) when the run cannot mutate, and with
    /// `StorageUnavailable` when either store is down.
    #[instrument(skip(self, run, proposal), fields(proposal_id = %proposal.id, key = %proposal.target_key), err)]
    pub async fn decide(
        &self,
        run: &TaskRun,
        proposal: &DeltaProposal,
    ) -> DomainResult<DeltaDecision> {
        if !run.permission_mode.allows_mutation() {
            warn!(
                run_id = %run.id,
                mode = %run.permission_mode,
                "governor call blocked: permission level is read-only"
            );
            self.recorder
                .append(
                    run.id,
                    EventDraft::new(
                        EventKind::Message,
                        json!({
                            "blocked_operation": "delta_decide",
                            "proposal_id": proposal.id,
                            "permission_mode": run.permission_mode,
                        }),
                    ),
                )
                .await?;
            return Err(DomainError::PermissionDenied {
                operation: "delta_decide".to_string(),
                required: crate::domain::models::PermissionMode::AcceptEdits,
                actual: run.permission_mode,
            });
        }

        // Claim the target key. A second concurrent proposal against the
        // same key is rejected, never queued.
        let claimed = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.insert(proposal.target_key.clone())
        };
        if !claimed {
            let decision = DeltaDecision::Rejected {
                category: RejectCategory::ConflictsWithExisting,
                rationale: format!(
                    "another proposal is in flight against key {}",
                    proposal.target_key
                ),
            };
            self.record_decision(run, proposal, &decision, None).await?;
            return Ok(decision);
        }

        let result = self.decide_claimed(run, proposal).await;

        self.in_flight
            .lock()
            .await
            .remove(&proposal.target_key);

        result
    }

    /// Record an explicit curator rejection. The playbook is untouched; the
    /// decision event is the only effect.
    #[instrument(skip(self, run, proposal), fields(proposal_id = %proposal.id), err)]
    pub async fn reject(
        &self,
        run: &TaskRun,
        proposal: &DeltaProposal,
        category: RejectCategory,
        rationale: impl Into<String> + std::fmt::Debug,
    ) -> DomainResult<DeltaDecision> {
        let decision = DeltaDecision::Rejected {
            category,
            rationale: rationale.into(),
        };
        self.record_decision(run, proposal, &decision, None).await?;
        Ok(decision)
    }

    /// Decision path once the key is claimed; the caller releases the claim.
    async fn decide_claimed(
        &self,
        run: &TaskRun,
        proposal: &DeltaProposal,
    ) -> DomainResult<DeltaDecision> {
        if let Some(decision) = self.evaluate_evidence(proposal) {
            self.record_decision(run, proposal, &decision, None).await?;
            return Ok(decision);
        }

        if proposal.requires_proof() {
            if let Some(bundle) = &proposal.proof {
                if bundle.mode == ProofMode::Degraded {
                    // Reachable only when the override flag is set.
                    warn!(
                        proposal_id = %proposal.id,
                        "accepting degraded proof bundle under explicit override"
                    );
                    self.recorder
                        .append(
                            run.id,
                            EventDraft::new(
                                EventKind::Message,
                                json!({
                                    "degraded_proof_override": true,
                                    "proposal_id": proposal.id,
                                }),
                            ),
                        )
                        .await?;
                }
            }
        }

        let decision = match self.apply(proposal).await {
            Ok(new_version) => {
                let decision = DeltaDecision::Accepted {
                    rationale: proposal.rationale.clone(),
                };
                info!(
                    proposal_id = %proposal.id,
                    key = %proposal.target_key,
                    version = new_version,
                    "delta accepted"
                );
                self.record_decision(run, proposal, &decision, Some(new_version))
                    .await?;
                return Ok(decision);
            }
            Err(PlaybookError::VersionConflict { key, .. }) => DeltaDecision::Rejected {
                category: RejectCategory::ConflictsWithExisting,
                rationale: format!("playbook key {key} changed since it was read"),
            },
            Err(PlaybookError::NotFound(key)) => DeltaDecision::Rejected {
                category: RejectCategory::Other,
                rationale: format!("target entry {key} does not exist"),
            },
            Err(PlaybookError::Unavailable(msg)) => {
                return Err(DomainError::StorageUnavailable(msg));
            }
            Err(PlaybookError::Serialization(msg)) => {
                return Err(DomainError::SerializationError(msg));
            }
        };

        self.record_decision(run, proposal, &decision, None).await?;
        Ok(decision)
    }

    /// Pre-mutation checks that can only reject: proof policy and the
    /// confidence floor. `None` means the proposal may proceed.
    fn evaluate_evidence(&self, proposal: &DeltaProposal) -> Option<DeltaDecision> {
        let verdict = self.validator.validate(
            proposal,
            &self.config.coverage_thresholds,
            self.config.allow_degraded_proof,
        );
        if !verdict.passed {
            let category = match &proposal.proof {
                None => RejectCategory::InsufficientEvidence,
                Some(bundle)
                    if bundle.mode == ProofMode::Degraded
                        && !self.config.allow_degraded_proof =>
                {
                    RejectCategory::InsufficientEvidence
                }
                Some(_) => RejectCategory::TestFailure,
            };
            return Some(DeltaDecision::Rejected {
                category,
                rationale: verdict.reasons.join("; "),
            });
        }

        if self.config.min_delta_confidence > 0.0 {
            if let Some(confidence) = proposal.confidence {
                if confidence < self.config.min_delta_confidence {
                    return Some(DeltaDecision::Rejected {
                        category: RejectCategory::LowConfidence,
                        rationale: format!(
                            "confidence {confidence:.2} below floor {:.2}",
                            self.config.min_delta_confidence
                        ),
                    });
                }
            }
        }

        None
    }

    /// Mutate the playbook exactly once for an accepted proposal. Uses the
    /// version read here as the optimistic write expectation.
    async fn apply(&self, proposal: &DeltaProposal) -> Result<u64, PlaybookError> {
        let existing = self.playbook.read(&proposal.target_key).await?;
        let current_version = existing.as_ref().map_or(0, |v| v.version);

        match proposal.op {
            DeltaOp::Add | DeltaOp::Update => {
                let mut entry = existing.map_or_else(
                    || PlaybookEntry::new(proposal.content.clone()),
                    |v| v.entry,
                );
                entry.strategy = proposal.content.clone();
                entry.tags = proposal
                    .tags
                    .iter()
                    .filter(|t| *t != crate::domain::models::REQUIRES_PROOF_TAG)
                    .cloned()
                    .collect();
                self.playbook
                    .write(&proposal.target_key, entry, current_version)
                    .await
            }
            DeltaOp::Remove => {
                if current_version == 0 {
                    return Err(PlaybookError::NotFound(proposal.target_key.clone()));
                }
                self.playbook
                    .remove(&proposal.target_key, current_version)
                    .await?;
                Ok(current_version)
            }
        }
    }

    async fn record_decision(
        &self,
        run: &TaskRun,
        proposal: &DeltaProposal,
        decision: &DeltaDecision,
        new_version: Option<u64>,
    ) -> DomainResult<()> {
        self.recorder
            .append(
                run.id,
                EventDraft::new(
                    EventKind::DeltaDecided,
                    json!({
                        "proposal_id": proposal.id,
                        "target_key": proposal.target_key,
                        "decision": decision,
                        "new_version": new_version,
                    }),
                ),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::delta::ProofBundle;
    use crate::domain::models::run::{PermissionMode, Phase};
    use crate::domain::models::REQUIRES_PROOF_TAG;
    use crate::infrastructure::playbook::InMemoryPlaybookStore;
    use crate::infrastructure::transcript::InMemoryTranscriptStore;
    use crate::services::replay::replay;
    use crate::domain::models::event::SequenceNumber;
    use uuid::Uuid;

    fn governor() -> (DeltaGovernor, Arc<InMemoryPlaybookStore>, Arc<TranscriptRecorder>) {
        let playbook = Arc::new(InMemoryPlaybookStore::new());
        let recorder = Arc::new(TranscriptRecorder::new(Arc::new(
            InMemoryTranscriptStore::new(),
        )));
        let governor = DeltaGovernor::new(
            Arc::clone(&playbook) as Arc<dyn PlaybookStore>,
            Arc::clone(&recorder),
            RunConfig::default(),
        );
        (governor, playbook, recorder)
    }

    fn run() -> TaskRun {
        TaskRun::new("objective", None, PermissionMode::AcceptEdits)
    }

    fn passing_bundle() -> ProofBundle {
        ProofBundle {
            passed: true,
            coverage_branch: 0.85,
            coverage_lines: 0.9,
            total_tests: 12,
            failed_tests: 0,
            artifacts: vec![],
            mode: ProofMode::Full,
            stderr_summary: None,
            duration_seconds: 1.0,
            report_path: None,
        }
    }

    fn proposal(run: &TaskRun, key: &str) -> DeltaProposal {
        DeltaProposal::new(
            run.id,
            Phase::Build,
            DeltaOp::Add,
            key,
            "validate request payloads",
            "new strategy from build",
        )
    }

    #[tokio::test]
    async fn test_accept_mutates_playbook_once() {
        let (governor, playbook, _) = governor();
        let run = run();
        let p = proposal(&run, "validation/input");

        let decision = governor.decide(&run, &p).await.unwrap();
        assert!(decision.is_accepted());

        let stored = playbook.read("validation/input").await.unwrap().unwrap();
        assert_eq!(stored.entry.strategy, "validate request payloads");
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_requires_proof_without_bundle_rejected() {
        let (governor, playbook, _) = governor();
        let run = run();
        let p = proposal(&run, "validation/input").with_tag(REQUIRES_PROOF_TAG);

        let decision = governor.decide(&run, &p).await.unwrap();
        assert_eq!(
            decision.category(),
            Some(RejectCategory::InsufficientEvidence)
        );
        assert!(playbook.read("validation/input").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requires_proof_below_floor_is_test_failure() {
        let (governor, _, _) = governor();
        let run = run();
        let mut bundle = passing_bundle();
        bundle.coverage_branch = 0.70;
        let p = proposal(&run, "validation/input")
            .with_tag(REQUIRES_PROOF_TAG)
            .with_proof(bundle);

        let decision = governor.decide(&run, &p).await.unwrap();
        assert_eq!(decision.category(), Some(RejectCategory::TestFailure));
    }

    #[tokio::test]
    async fn test_requires_proof_full_bundle_accepted() {
        let (governor, _, _) = governor();
        let run = run();
        let p = proposal(&run, "validation/input")
            .with_tag(REQUIRES_PROOF_TAG)
            .with_proof(passing_bundle());

        assert!(governor.decide(&run, &p).await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn test_degraded_bundle_needs_override() {
        let (governor, _, _) = governor();
        let run = run();
        let p = proposal(&run, "k")
            .with_tag(REQUIRES_PROOF_TAG)
            .with_proof(ProofBundle::degraded("dry run"));
        let decision = governor.decide(&run, &p).await.unwrap();
        assert_eq!(
            decision.category(),
            Some(RejectCategory::InsufficientEvidence)
        );
    }

    #[tokio::test]
    async fn test_degraded_override_is_logged() {
        let playbook = Arc::new(InMemoryPlaybookStore::new());
        let recorder = Arc::new(TranscriptRecorder::new(Arc::new(
            InMemoryTranscriptStore::new(),
        )));
        let config = RunConfig {
            allow_degraded_proof: true,
            ..RunConfig::default()
        };
        let governor = DeltaGovernor::new(
            playbook as Arc<dyn PlaybookStore>,
            Arc::clone(&recorder),
            config,
        );
        let run = run();
        let mut bundle = passing_bundle();
        bundle.mode = ProofMode::Degraded;
        let p = proposal(&run, "k")
            .with_tag(REQUIRES_PROOF_TAG)
            .with_proof(bundle);

        let decision = governor.decide(&run, &p).await.unwrap();
        assert!(decision.is_accepted());

        let events = recorder.read(run.id, SequenceNumber(0)).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.payload.get("degraded_proof_override").is_some()));
    }

    #[tokio::test]
    async fn test_permission_denied_is_logged_not_decided() {
        let (governor, _, recorder) = governor();
        let run = TaskRun::new("objective", None, PermissionMode::Plan);
        let p = proposal(&run, "k");

        let err = governor.decide(&run, &p).await.unwrap_err();
        assert!(matches!(err, DomainError::PermissionDenied { .. }));
        assert!(err.is_recoverable());

        let events = recorder.read(run.id, SequenceNumber(0)).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.payload.get("blocked_operation").is_some()));
        assert!(!events.iter().any(|e| e.kind == EventKind::DeltaDecided));
    }

    #[tokio::test]
    async fn test_low_confidence_rejected_when_floor_set() {
        let playbook = Arc::new(InMemoryPlaybookStore::new());
        let recorder = Arc::new(TranscriptRecorder::new(Arc::new(
            InMemoryTranscriptStore::new(),
        )));
        let config = RunConfig {
            min_delta_confidence: 0.5,
            ..RunConfig::default()
        };
        let governor =
            DeltaGovernor::new(playbook as Arc<dyn PlaybookStore>, recorder, config);
        let run = run();
        let p = proposal(&run, "k").with_confidence(0.2);

        let decision = governor.decide(&run, &p).await.unwrap();
        assert_eq!(decision.category(), Some(RejectCategory::LowConfidence));
    }

    #[tokio::test]
    async fn test_remove_of_absent_key_rejected() {
        let (governor, _, _) = governor();
        let run = run();
        let mut p = proposal(&run, "missing");
        p.op = DeltaOp::Remove;

        let decision = governor.decide(&run, &p).await.unwrap();
        assert_eq!(decision.category(), Some(RejectCategory::Other));
    }

    #[tokio::test]
    async fn test_concurrent_accepts_against_same_key() {
        let playbook = Arc::new(InMemoryPlaybookStore::new());
        let recorder = Arc::new(TranscriptRecorder::new(Arc::new(
            InMemoryTranscriptStore::new(),
        )));
        let governor = Arc::new(DeltaGovernor::new(
            playbook as Arc<dyn PlaybookStore>,
            recorder,
            RunConfig::default(),
        ));
        let run = Arc::new(run());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let governor = Arc::clone(&governor);
            let run = Arc::clone(&run);
            handles.push(tokio::spawn(async move {
                let p = DeltaProposal::new(
                    run.id,
                    Phase::Build,
                    DeltaOp::Add,
                    "contested/key",
                    "content",
                    "rationale",
                );
                governor.decide(&run, &p).await.unwrap()
            }));
        }

        let mut accepted = 0;
        let mut conflicted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                DeltaDecision::Accepted { .. } => accepted += 1,
                DeltaDecision::Rejected { category, .. } => {
                    assert_eq!(category, RejectCategory::ConflictsWithExisting);
                    conflicted += 1;
                }
            }
        }

        // At most one accept may be in flight per key; the serialized
        // survivors see a version conflict or the in-flight claim.
        assert!(accepted >= 1);
        assert_eq!(accepted + conflicted, 8);
    }

    #[tokio::test]
    async fn test_decisions_are_replayable() {
        let (governor, _, recorder) = governor();
        let run = run();
        let p1 = proposal(&run, "a");
        let p2 = proposal(&run, "b").with_tag(REQUIRES_PROOF_TAG);

        governor.decide(&run, &p1).await.unwrap();
        governor.decide(&run, &p2).await.unwrap();

        let events = recorder.read(run.id, SequenceNumber(0)).await.unwrap();
        let replayed = replay(&events).unwrap();
        assert!(replayed.decisions[&p1.id].is_accepted());
        assert_eq!(
            replayed.decisions[&p2.id].category(),
            Some(RejectCategory::InsufficientEvidence)
        );
    }
}
