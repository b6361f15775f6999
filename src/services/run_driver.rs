//! Run driver.
//!
//! The single logical control flow for one run: it owns the `TaskRun`,
//! feeds the pure phase machine, and executes the effects the machine
//! requests. Build/Test work is delegated through the coordinator; Review
//! consults the governor; Document renders the closing summary.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::delta::{
    DeltaDecision, DeltaOp, DeltaProposal, ProofBundle, RejectCategory,
};
use crate::domain::models::event::{EventDraft, EventKind, PhaseTransitionPayload};
use crate::domain::models::run::{DeltaInput, PermissionMode, Phase, RunOutcome, TaskRun};
use crate::domain::models::session::{AgentRole, SubagentSession, SubagentTask};
use crate::domain::models::summary::ClosedCycleSummary;
use crate::domain::models::{RunConfig, REQUIRES_PROOF_TAG};
use crate::domain::ports::PlaybookStore;
use crate::services::delta_governor::DeltaGovernor;
use crate::services::phase_machine::{transition, Effect, PhaseEvent, PhaseState};
use crate::services::subagent_coordinator::{OnFailure, SubagentCoordinator};
use crate::services::transcript_recorder::TranscriptRecorder;

/// A finished run with its closing summary (present on Complete).
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub run: TaskRun,
    pub summary: Option<ClosedCycleSummary>,
}

/// Drives a single task run through the skills loop.
pub struct RunDriver {
    recorder: Arc<TranscriptRecorder>,
    governor: Arc<DeltaGovernor>,
    coordinator: Arc<SubagentCoordinator>,
    playbook: Arc<dyn PlaybookStore>,
    config: RunConfig,
}

/// Mutable per-run bookkeeping threaded through the phases.
struct RunContext {
    run: TaskRun,
    state: PhaseState,
    deadline: Instant,
    context_snapshot: Option<String>,
    pending: Option<DeltaProposal>,
    accepted: Vec<DeltaProposal>,
    rejected: Vec<DeltaProposal>,
    blocked: Vec<DeltaProposal>,
    test_results: Vec<ProofBundle>,
}

impl RunDriver {
    pub fn new(
        recorder: Arc<TranscriptRecorder>,
        governor: Arc<DeltaGovernor>,
        coordinator: Arc<SubagentCoordinator>,
        playbook: Arc<dyn PlaybookStore>,
        config: RunConfig,
    ) -> Self {
        Self {
            recorder,
            governor,
            coordinator,
            playbook,
            config,
        }
    }

    /// Execute a full run. Always returns a run in exactly one terminal
    /// state; partial progress stays in the transcript, and accepted deltas
    /// are never rolled back by a later abort.
    #[instrument(skip(self, objective, delta_input), err)]
    pub async fn execute(
        &self,
        objective: &str,
        delta_input: Option<DeltaInput>,
        permission_mode: Option<PermissionMode>,
    ) -> DomainResult<CompletedRun> {
        let mode = permission_mode.unwrap_or(self.config.default_permission_mode);
        let run = TaskRun::new(objective, delta_input, mode);

        self.recorder
            .append(
                run.id,
                EventDraft::new(
                    EventKind::Message,
                    json!({
                        "run_started": {
                            "objective": run.objective,
                            "permission_mode": run.permission_mode,
                            "delta_input": run.delta_input,
                        }
                    }),
                ),
            )
            .await?;

        let mut ctx = RunContext {
            run,
            state: PhaseState::new(),
            deadline: Instant::now() + Duration::from_secs(self.config.run_timeout_seconds),
            context_snapshot: None,
            pending: None,
            accepted: Vec::new(),
            rejected: Vec::new(),
            blocked: Vec::new(),
            test_results: Vec::new(),
        };

        let mut summary = None;
        while !ctx.state.phase.is_terminal() {
            if Instant::now() >= ctx.deadline {
                let cancelled = self.coordinator.cancel_run(ctx.run.id).await;
                warn!(run_id = %ctx.run.id, cancelled = cancelled.len(), "run timeout exceeded");
                self.apply_event(&mut ctx, &PhaseEvent::RunTimedOut).await?;
                break;
            }

            let step = match ctx.state.phase {
                Phase::Plan => self.run_plan(&mut ctx).await,
                Phase::Build => self.run_build(&mut ctx).await,
                Phase::Test => self.run_test(&mut ctx).await,
                Phase::Review => self.run_review(&mut ctx).await,
                Phase::Document => match self.run_document(&mut ctx).await {
                    Ok(s) => {
                        summary = Some(s);
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
                Phase::Complete | Phase::Aborted => break,
            };

            if let Err(err) = step {
                if err.is_recoverable() {
                    // Recoverable errors already produced their transcript
                    // record; surfacing them here would be double handling.
                    warn!(run_id = %ctx.run.id, error = %err, "recoverable phase error");
                    continue;
                }
                error!(run_id = %ctx.run.id, error = %err, "unrecoverable phase error");
                let failed = PhaseEvent::CollaboratorFailed {
                    reason: err.to_string(),
                };
                if let Err(abort_err) = self.apply_event(&mut ctx, &failed).await {
                    // Storage may be the very thing that died; the run still
                    // must end in exactly one terminal state.
                    error!(run_id = %ctx.run.id, error = %abort_err, "abort could not be recorded");
                    ctx.run.finalize(RunOutcome::Aborted {
                        reason: err.to_string(),
                    });
                    break;
                }
            }
        }

        // Defensive finalization: the loop above must leave a terminal run.
        if !ctx.run.is_terminal() {
            ctx.run.finalize(RunOutcome::Aborted {
                reason: "driver exited without terminal state".to_string(),
            });
            if let Err(err) = self.record_finalized(&ctx.run, None).await {
                warn!(run_id = %ctx.run.id, error = %err, "final event could not be recorded");
            }
        }

        Ok(CompletedRun {
            run: ctx.run,
            summary,
        })
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    /// Plan: delegate the analyzer over a playbook snapshot and record the
    /// resulting plan artifact as a plan-tagged proposal.
    async fn run_plan(&self, ctx: &mut RunContext) -> DomainResult<()> {
        let snapshot = self
            .playbook
            .snapshot()
            .await
            .map_err(|e| DomainError::StorageUnavailable(e.to_string()))?;
        ctx.context_snapshot = Some(snapshot.to_context_summary(20));

        let session = self
            .delegate_and_wait(
                ctx,
                AgentRole::Analyzer,
                format!(
                    "Produce an implementation plan for the objective: {}",
                    ctx.run.objective
                ),
                PermissionMode::Plan,
            )
            .await?;

        if !session.state.is_success() {
            return self
                .apply_event(
                    ctx,
                    &PhaseEvent::CollaboratorFailed {
                        reason: format!("plan session {} finished {}", session.id, session.state),
                    },
                )
                .await;
        }

        let plan_text = session
            .outcome
            .as_ref()
            .and_then(|o| o.payload.get("plan"))
            .and_then(|v| v.as_str())
            .unwrap_or("plan produced without structured payload")
            .to_string();

        let proposal = DeltaProposal::new(
            ctx.run.id,
            Phase::Plan,
            DeltaOp::Add,
            ctx.run.target_key(),
            plan_text,
            format!("plan for objective: {}", ctx.run.objective),
        )
        .with_tag("phase=plan");

        self.record_proposed(&ctx.run, &proposal).await?;
        self.apply_event(
            ctx,
            &PhaseEvent::PlanRecorded {
                proposal_id: proposal.id,
            },
        )
        .await
    }

    /// Build: delegate the builder; a successful outcome becomes the pending
    /// delta proposal (or a revision of the rejected one on retries).
    async fn run_build(&self, ctx: &mut RunContext) -> DomainResult<()> {
        let session = match self
            .delegate_and_wait(
                ctx,
                AgentRole::Builder,
                format!("Implement the planned change for: {}", ctx.run.objective),
                ctx.run.permission_mode.min(PermissionMode::AcceptEdits),
            )
            .await
        {
            Ok(session) => session,
            Err(DomainError::SubagentTimeout(id)) => {
                return self
                    .apply_event(
                        ctx,
                        &PhaseEvent::BuildFailed {
                            reason: format!("builder session {id} timed out"),
                        },
                    )
                    .await;
            }
            Err(err) => return Err(err),
        };

        let Some(outcome) = session.outcome.as_ref().filter(|o| o.success) else {
            return self
                .apply_event(
                    ctx,
                    &PhaseEvent::BuildFailed {
                        reason: format!("builder session {} did not succeed", session.id),
                    },
                )
                .await;
        };

        let content = outcome
            .payload
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or(&ctx.run.objective)
            .to_string();

        let proposal = match ctx.pending.take() {
            // Revision path: link the fresh attempt to the rejected ancestor.
            Some(prior) => prior.revise(content, "revised after rejection"),
            None => {
                let mut proposal = DeltaProposal::new(
                    ctx.run.id,
                    Phase::Build,
                    DeltaOp::Add,
                    ctx.run.target_key(),
                    content,
                    format!("build output for objective: {}", ctx.run.objective),
                )
                .with_tag(REQUIRES_PROOF_TAG);
                if let Some(confidence) = outcome.confidence {
                    proposal = proposal.with_confidence(confidence);
                }
                proposal
            }
        };

        self.record_proposed(&ctx.run, &proposal).await?;
        ctx.pending = Some(proposal);
        self.apply_event(ctx, &PhaseEvent::BuildSucceeded).await
    }

    /// Test: delegate the tester and attach its proof bundle to the pending
    /// proposal.
    async fn run_test(&self, ctx: &mut RunContext) -> DomainResult<()> {
        self.recorder
            .append(
                ctx.run.id,
                EventDraft::new(
                    EventKind::ToolInvocationStart,
                    json!({"tool": "test_runner", "target": ctx.run.target_key()}),
                ),
            )
            .await?;

        let session = self
            .delegate_and_wait(
                ctx,
                AgentRole::Tester,
                "Execute the verification suite and report coverage.".to_string(),
                PermissionMode::Plan,
            )
            .await?;

        let bundle = session
            .outcome
            .as_ref()
            .and_then(|o| serde_json::from_value::<ProofBundle>(o.payload.clone()).ok())
            .unwrap_or_else(|| ProofBundle::degraded("tester returned no proof bundle"));

        self.recorder
            .append(
                ctx.run.id,
                EventDraft::new(
                    EventKind::ToolInvocationResult,
                    json!({"tool": "test_runner", "result": bundle}),
                )
                .with_subagent(session.id),
            )
            .await?;

        let passed = bundle.passed;
        ctx.test_results.push(bundle.clone());
        if let Some(pending) = ctx.pending.take() {
            ctx.pending = Some(pending.with_proof(bundle));
        }

        self.apply_event(ctx, &PhaseEvent::TestCompleted { passed })
            .await
    }

    /// Review: every pending proposal gets a governor decision; a rejection
    /// with a revision path sends the loop back to Build.
    async fn run_review(&self, ctx: &mut RunContext) -> DomainResult<()> {
        let Some(proposal) = ctx.pending.take() else {
            return self
                .apply_event(
                    ctx,
                    &PhaseEvent::ReviewCompleted {
                        revision_requested: false,
                    },
                )
                .await;
        };

        match self.governor.decide(&ctx.run, &proposal).await {
            Ok(DeltaDecision::Accepted { .. }) => {
                ctx.accepted.push(proposal);
                self.apply_event(
                    ctx,
                    &PhaseEvent::ReviewCompleted {
                        revision_requested: false,
                    },
                )
                .await
            }
            Ok(DeltaDecision::Rejected { category, .. }) => {
                let revisable = matches!(
                    category,
                    RejectCategory::TestFailure | RejectCategory::InsufficientEvidence
                );
                let retries_left =
                    ctx.state.retry_count(Phase::Build) < self.config.max_phase_retries;
                if revisable && retries_left {
                    // The rejected proposal stays closed; Build will spawn a
                    // revision linked to it.
                    ctx.pending = Some(proposal.clone());
                    ctx.rejected.push(proposal);
                    self.apply_event(
                        ctx,
                        &PhaseEvent::ReviewCompleted {
                            revision_requested: true,
                        },
                    )
                    .await
                } else {
                    ctx.rejected.push(proposal);
                    self.apply_event(
                        ctx,
                        &PhaseEvent::ReviewCompleted {
                            revision_requested: revisable,
                        },
                    )
                    .await
                }
            }
            Err(DomainError::PermissionDenied { .. }) => {
                // Blocked operation: logged by the governor, run unaffected.
                ctx.blocked.push(proposal);
                self.apply_event(
                    ctx,
                    &PhaseEvent::ReviewCompleted {
                        revision_requested: false,
                    },
                )
                .await
            }
            Err(err) => Err(err),
        }
    }

    /// Document: render and record the closing summary.
    async fn run_document(&self, ctx: &mut RunContext) -> DomainResult<ClosedCycleSummary> {
        let summary = ClosedCycleSummary {
            run_id: ctx.run.id,
            completed_at: Utc::now(),
            accepted_deltas: ctx.accepted.iter().map(|p| p.id).collect(),
            rejected_deltas: ctx.rejected.iter().map(|p| p.id).collect(),
            blocked_deltas: ctx.blocked.iter().map(|p| p.id).collect(),
            test_results: ctx.test_results.clone(),
            permission_modes: vec![ctx.run.permission_mode],
            artifact_links: ctx
                .test_results
                .iter()
                .enumerate()
                .filter_map(|(i, r)| {
                    r.report_path
                        .as_ref()
                        .map(|p| (format!("test_report_{i}"), p.clone()))
                })
                .collect(),
        };

        self.apply_event(ctx, &PhaseEvent::SummaryRecorded).await?;
        self.record_finalized(&ctx.run, Some(&summary)).await?;
        info!(
            run_id = %ctx.run.id,
            accepted = summary.accepted_deltas.len(),
            rejected = summary.rejected_deltas.len(),
            "run documented"
        );
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Effects and helpers
    // ------------------------------------------------------------------

    /// Feed one event through the pure machine and execute its effects.
    async fn apply_event(&self, ctx: &mut RunContext, event: &PhaseEvent) -> DomainResult<()> {
        let (next, effects) = transition(&ctx.state, event, self.config.max_phase_retries)?;
        ctx.state = next;
        ctx.run.phase = ctx.state.phase;
        ctx.run.retries = ctx.state.retries.clone();

        for effect in effects {
            match effect {
                Effect::EmitTransition {
                    from,
                    to,
                    retry_count,
                    trigger_reason,
                } => {
                    self.recorder
                        .append(
                            ctx.run.id,
                            PhaseTransitionPayload {
                                from_phase: from,
                                to_phase: to,
                                retry_count,
                                trigger_reason,
                            }
                            .into_draft(),
                        )
                        .await?;
                }
                Effect::AbortRun { reason } => {
                    self.coordinator.cancel_run(ctx.run.id).await;
                    ctx.run.finalize(RunOutcome::Aborted { reason });
                    self.record_finalized(&ctx.run, None).await?;
                }
                Effect::CompleteRun => {
                    ctx.run.finalize(RunOutcome::Complete);
                }
            }
        }
        Ok(())
    }

    /// Delegate a role with the run's inherited context and block until the
    /// session reaches a terminal state (control transfer handoff).
    async fn delegate_and_wait(
        &self,
        ctx: &RunContext,
        role: AgentRole,
        description: String,
        permission_mode: PermissionMode,
    ) -> DomainResult<SubagentSession> {
        let mut task = SubagentTask::new(description, permission_mode)
            .with_timeout(self.config.subagent_timeout_seconds);
        if let Some(snapshot) = &ctx.context_snapshot {
            task = task.with_context(snapshot.clone());
        }

        let session = self
            .coordinator
            .delegate(&ctx.run, None, role, task, ctx.context_snapshot.is_some())
            .await?;
        self.coordinator
            .handoff(
                session.id,
                true,
                self.config.subagent_timeout_seconds,
                OnFailure::Escalate,
            )
            .await
    }

    async fn record_proposed(&self, run: &TaskRun, proposal: &DeltaProposal) -> DomainResult<()> {
        self.recorder
            .append(
                run.id,
                EventDraft::new(EventKind::DeltaProposed, serde_json::to_value(proposal)?),
            )
            .await?;
        Ok(())
    }

    async fn record_finalized(
        &self,
        run: &TaskRun,
        summary: Option<&ClosedCycleSummary>,
    ) -> DomainResult<()> {
        let markdown = summary.map(ClosedCycleSummary::render_markdown);
        self.recorder
            .append(
                run.id,
                EventDraft::new(
                    EventKind::RunFinalized,
                    json!({
                        "outcome": run.outcome,
                        "summary": summary,
                        "markdown": markdown,
                    }),
                ),
            )
            .await?;
        Ok(())
    }
}
