//! Subagent coordinator service.
//!
//! Manages delegation, handoff, forking, and convergence of concurrently
//! running child agent sessions. Session bookkeeping lives in an explicit
//! registry keyed by session id with `parent_session_id` back-references;
//! lookups traverse the registry, never live references.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio::task::AbortHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::convergence::{
    values_match, Conflict, ConflictResolution, ConvergenceResult, ConvergenceStrategy,
};
use crate::domain::models::event::{EventDraft, EventKind};
use crate::domain::models::run::TaskRun;
use crate::domain::models::session::{
    AgentRole, SessionState, SubagentOutcome, SubagentSession, SubagentTask,
};
use crate::domain::models::RunConfig;
use crate::domain::ports::SubagentRunner;
use crate::services::transcript_recorder::TranscriptRecorder;

/// Policy applied when a handoff times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnFailure {
    /// Respawn the session once and wait again.
    Retry,
    /// Mark the session timed out and return its snapshot.
    Abort,
    /// Surface the timeout to the caller; never silently retry.
    #[default]
    Escalate,
}

struct SessionEntry {
    session: SubagentSession,
    state_tx: watch::Sender<SessionState>,
    abort: Option<AbortHandle>,
}

/// Delegation, handoff, fork, and convergence for child agent sessions.
pub struct SubagentCoordinator {
    runner: Arc<dyn SubagentRunner>,
    recorder: Arc<TranscriptRecorder>,
    config: RunConfig,
    registry: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
}

impl SubagentCoordinator {
    pub fn new(
        runner: Arc<dyn SubagentRunner>,
        recorder: Arc<TranscriptRecorder>,
        config: RunConfig,
    ) -> Self {
        Self {
            runner,
            recorder,
            config,
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Snapshot a session by id.
    pub async fn session(&self, session_id: Uuid) -> DomainResult<SubagentSession> {
        let registry = self.registry.read().await;
        registry
            .get(&session_id)
            .map(|entry| entry.session.clone())
            .ok_or(DomainError::SessionNotFound(session_id))
    }

    /// Snapshot every session belonging to a run.
    pub async fn sessions_for_run(&self, run_id: Uuid) -> Vec<SubagentSession> {
        let registry = self.registry.read().await;
        let mut sessions: Vec<SubagentSession> = registry
            .values()
            .filter(|entry| entry.session.run_id == run_id)
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by_key(|s| s.spawned_at);
        sessions
    }

    /// Delegate a bounded subtask to a child session.
    ///
    /// Spawns asynchronously; the parent is not blocked. Rejected with
    /// `PermissionEscalationDenied` when the child's mode exceeds the
    /// parent's, `DelegationDepthExceeded` past the configured nesting
    /// limit, and `ConvergenceBacklog` while a previously active non-forked
    /// sibling has not reached a terminal state (sequential convergence
    /// discipline).
    #[instrument(skip(self, run, task), fields(run_id = %run.id, role = %role), err)]
    pub async fn delegate(
        &self,
        run: &TaskRun,
        parent_session_id: Option<Uuid>,
        role: AgentRole,
        task: SubagentTask,
        inherit_context: bool,
    ) -> DomainResult<SubagentSession> {
        let (parent_mode, depth) = match parent_session_id {
            Some(parent_id) => {
                let parent = self.session(parent_id).await?;
                (parent.task.permission_mode, parent.depth + 1)
            }
            None => (run.permission_mode, 1),
        };

        if task.permission_mode > parent_mode {
            return Err(DomainError::PermissionEscalationDenied {
                requested: task.permission_mode,
                parent: parent_mode,
            });
        }

        if depth > self.config.max_delegation_depth {
            return Err(DomainError::DelegationDepthExceeded {
                depth,
                max: self.config.max_delegation_depth,
            });
        }

        {
            let registry = self.registry.read().await;
            let backlog = registry.values().find(|entry| {
                entry.session.run_id == run.id
                    && entry.session.parent_session_id == parent_session_id
                    && !entry.session.forked
                    && !entry.session.state.is_terminal()
            });
            if let Some(entry) = backlog {
                return Err(DomainError::ConvergenceBacklog(entry.session.id));
            }
        }

        let session =
            SubagentSession::new(run.id, parent_session_id, role, task, inherit_context, depth);
        self.spawn(run.id, session).await
    }

    /// Fork an independent session copying the source session's task at the
    /// fork point. Forked sessions never converge back; they are terminal
    /// branches for experimentation and exempt from sibling discipline.
    #[instrument(skip(self, run), fields(run_id = %run.id), err)]
    pub async fn fork(&self, run: &TaskRun, source_id: Uuid) -> DomainResult<SubagentSession> {
        let source = self.session(source_id).await?;
        let mut session = SubagentSession::new(
            run.id,
            source.parent_session_id,
            source.role,
            source.task.clone(),
            source.inherit_context,
            source.depth,
        );
        session.forked = true;
        self.spawn(run.id, session).await
    }

    /// Wait on (or observe) a session until terminal state or timeout.
    ///
    /// With `transfer_control` the parent logically suspends until the child
    /// finishes or the timeout elapses; without it the call is monitor mode
    /// and returns the current snapshot immediately. On timeout the
    /// `on_failure` policy decides: `Retry` respawns once, `Abort` marks the
    /// session timed out, `Escalate` (the default) surfaces
    /// `SubagentTimeout` to the caller.
    #[instrument(skip(self), err)]
    pub async fn handoff(
        &self,
        session_id: Uuid,
        transfer_control: bool,
        timeout_seconds: u64,
        on_failure: OnFailure,
    ) -> DomainResult<SubagentSession> {
        if !transfer_control {
            return self.session(session_id).await;
        }

        match self.await_terminal(session_id, timeout_seconds).await? {
            Some(session) => Ok(session),
            None => match on_failure {
                OnFailure::Escalate => {
                    self.mark_timed_out(session_id).await;
                    Err(DomainError::SubagentTimeout(session_id))
                }
                OnFailure::Abort => {
                    self.mark_timed_out(session_id).await;
                    self.session(session_id).await
                }
                OnFailure::Retry => {
                    warn!(%session_id, "handoff timed out; retrying once");
                    self.mark_timed_out(session_id).await;
                    let source = self.session(session_id).await?;
                    let mut retry = SubagentSession::new(
                        source.run_id,
                        source.parent_session_id,
                        source.role,
                        source.task.clone(),
                        source.inherit_context,
                        source.depth,
                    );
                    retry.forked = source.forked;
                    let retry = self.spawn(source.run_id, retry).await?;
                    match self.await_terminal(retry.id, timeout_seconds).await? {
                        Some(session) => Ok(session),
                        None => {
                            self.mark_timed_out(retry.id).await;
                            Err(DomainError::SubagentTimeout(retry.id))
                        }
                    }
                }
            },
        }
    }

    /// Reconcile one or more terminal sessions into a single outcome.
    #[instrument(skip(self, run), fields(run_id = %run.id, strategy = %strategy), err)]
    pub async fn converge(
        &self,
        run: &TaskRun,
        session_ids: &[Uuid],
        strategy: ConvergenceStrategy,
        resolution: ConflictResolution,
    ) -> DomainResult<ConvergenceResult> {
        if session_ids.is_empty() {
            return Err(DomainError::ValidationFailed(
                "convergence requires at least one session".to_string(),
            ));
        }

        let sessions = futures::future::join_all(session_ids.iter().map(|id| self.session(*id)))
            .await
            .into_iter()
            .collect::<DomainResult<Vec<SubagentSession>>>()?;

        for session in &sessions {
            if session.forked {
                return Err(DomainError::ValidationFailed(format!(
                    "forked session {} cannot converge",
                    session.id
                )));
            }
            if !session.state.is_terminal() {
                return Err(DomainError::ValidationFailed(format!(
                    "session {} is not terminal",
                    session.id
                )));
            }
            if strategy != ConvergenceStrategy::FirstSuccess && !session.state.is_success() {
                return Err(DomainError::ValidationFailed(format!(
                    "session {} is {} and only first_success tolerates non-success",
                    session.id, session.state
                )));
            }
        }

        let result = match strategy {
            ConvergenceStrategy::Merge => self.converge_merge(&sessions, resolution)?,
            ConvergenceStrategy::Vote => self.converge_vote(&sessions, resolution)?,
            ConvergenceStrategy::Consensus => {
                match self.converge_consensus(&sessions) {
                    Ok(result) => result,
                    Err(err) => {
                        // No partial output; the manual-review signal is the
                        // sole outcome, recorded before surfacing.
                        self.recorder
                            .append(
                                run.id,
                                EventDraft::new(
                                    EventKind::Message,
                                    json!({
                                        "manual_review_required": err.to_string(),
                                        "strategy": strategy,
                                        "session_ids": session_ids,
                                    }),
                                ),
                            )
                            .await?;
                        return Err(err);
                    }
                }
            }
            ConvergenceStrategy::FirstSuccess => self.converge_first_success(&sessions)?,
        };

        self.recorder
            .append(
                run.id,
                EventDraft::new(EventKind::Message, json!({ "convergence": result })),
            )
            .await?;

        info!(
            sessions = sessions.len(),
            conflicts = result.conflicts.len(),
            "convergence complete"
        );
        Ok(result)
    }

    /// Cancel every non-terminal session of a run, marking it timed out.
    /// Used by the driver when the run-level timeout fires.
    pub async fn cancel_run(&self, run_id: Uuid) -> Vec<Uuid> {
        let mut cancelled = Vec::new();
        let mut registry = self.registry.write().await;
        for entry in registry.values_mut() {
            if entry.session.run_id == run_id && !entry.session.state.is_terminal() {
                if let Some(abort) = entry.abort.take() {
                    abort.abort();
                }
                entry.session.state = SessionState::TimedOut;
                entry.session.finished_at = Some(Utc::now());
                entry.state_tx.send_replace(SessionState::TimedOut);
                cancelled.push(entry.session.id);
            }
        }
        cancelled
    }

    // ------------------------------------------------------------------
    // Spawning and lifecycle
    // ------------------------------------------------------------------

    /// Register a session and launch its task. The spawned future owns the
    /// state transitions Spawned → Active → terminal.
    async fn spawn(&self, run_id: Uuid, session: SubagentSession) -> DomainResult<SubagentSession> {
        let (state_tx, _) = watch::channel(session.state);
        let session_id = session.id;
        let snapshot = session.clone();

        self.recorder
            .append(
                run_id,
                EventDraft::new(
                    EventKind::SubagentSpawned,
                    json!({
                        "session_id": session.id,
                        "role": session.role,
                        "parent_session_id": session.parent_session_id,
                        "permission_mode": session.task.permission_mode,
                        "forked": session.forked,
                        "depth": session.depth,
                    }),
                )
                .with_subagent(session.id),
            )
            .await?;

        {
            let mut registry = self.registry.write().await;
            registry.insert(
                session_id,
                SessionEntry {
                    session,
                    state_tx,
                    abort: None,
                },
            );
        }

        let runner = Arc::clone(&self.runner);
        let recorder = Arc::clone(&self.recorder);
        let registry = Arc::clone(&self.registry);
        let task = snapshot.task.clone();
        let role = snapshot.role;
        let timeout = Duration::from_secs(task.timeout_seconds);

        let handle = tokio::spawn(async move {
            set_state(&registry, session_id, SessionState::Active, None).await;

            let outcome = tokio::time::timeout(timeout, runner.run(role, &task)).await;
            let (state, outcome) = match outcome {
                Ok(Ok(outcome)) if outcome.success => (SessionState::Converged, Some(outcome)),
                Ok(Ok(outcome)) => (SessionState::Failed, Some(outcome)),
                Ok(Err(err)) => (
                    SessionState::Failed,
                    Some(SubagentOutcome::failure(json!({"error": err.to_string()}))),
                ),
                Err(_) => (SessionState::TimedOut, None),
            };

            set_state(&registry, session_id, state, outcome.clone()).await;

            let stop_event = EventDraft::new(
                EventKind::SubagentStop,
                json!({
                    "session_id": session_id,
                    "state": state,
                    "outcome": outcome,
                }),
            )
            .with_subagent(session_id);
            if let Err(err) = recorder.append(run_id, stop_event).await {
                // The stop record is audit data; the session state itself is
                // already committed to the registry.
                warn!(%session_id, error = %err, "failed to record subagent stop");
            }
        });

        {
            let mut registry = self.registry.write().await;
            if let Some(entry) = registry.get_mut(&session_id) {
                entry.abort = Some(handle.abort_handle());
            }
        }

        Ok(snapshot)
    }

    /// Wait until a session reaches a terminal state; `None` on timeout.
    async fn await_terminal(
        &self,
        session_id: Uuid,
        timeout_seconds: u64,
    ) -> DomainResult<Option<SubagentSession>> {
        let mut state_rx = {
            let registry = self.registry.read().await;
            let entry = registry
                .get(&session_id)
                .ok_or(DomainError::SessionNotFound(session_id))?;
            if entry.session.state.is_terminal() {
                return Ok(Some(entry.session.clone()));
            }
            entry.state_tx.subscribe()
        };

        let deadline = Duration::from_secs(timeout_seconds);
        let wait = async {
            loop {
                if state_rx.borrow_and_update().is_terminal() {
                    return;
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        };

        if tokio::time::timeout(deadline, wait).await.is_err() {
            return Ok(None);
        }
        Ok(Some(self.session(session_id).await?))
    }

    async fn mark_timed_out(&self, session_id: Uuid) {
        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.get_mut(&session_id) {
            if !entry.session.state.is_terminal() {
                if let Some(abort) = entry.abort.take() {
                    abort.abort();
                }
                entry.session.state = SessionState::TimedOut;
                entry.session.finished_at = Some(Utc::now());
                entry.state_tx.send_replace(SessionState::TimedOut);
            }
        }
    }

    // ------------------------------------------------------------------
    // Strategies
    // ------------------------------------------------------------------

    /// Merge: concatenate non-overlapping contributions; overlapping
    /// contributions on the same target are conflicts for the resolution
    /// method.
    fn converge_merge(
        &self,
        sessions: &[SubagentSession],
        resolution: ConflictResolution,
    ) -> DomainResult<ConvergenceResult> {
        let mut contributions: BTreeMap<String, Vec<&SubagentSession>> = BTreeMap::new();
        for session in sessions {
            for target in contribution_targets(session) {
                contributions.entry(target).or_default().push(session);
            }
        }

        let mut merged = serde_json::Map::new();
        let mut conflicts = Vec::new();
        let mut resolved_any = false;

        for (target, contributors) in &contributions {
            let values: Vec<&Value> = contributors
                .iter()
                .map(|s| contribution_value(s, target))
                .collect();
            let all_equal = values.windows(2).all(|w| w[0] == w[1]);

            if contributors.len() == 1 || all_equal {
                merged.insert(target.clone(), values[0].clone());
                continue;
            }

            conflicts.push(Conflict {
                target: target.clone(),
                session_ids: contributors.iter().map(|s| s.id).collect(),
            });

            let winner = self.resolve_conflict(contributors, resolution)?;
            resolved_any = true;
            merged.insert(target.clone(), contribution_value(winner, target).clone());
        }

        Ok(ConvergenceResult {
            strategy: ConvergenceStrategy::Merge,
            session_ids: sessions.iter().map(|s| s.id).collect(),
            conflicts,
            resolution: resolved_any.then_some(resolution),
            payload: Value::Object(merged),
        })
    }

    /// Vote: requires ≥3 sessions; strict majority wins, ties escalate to
    /// the resolution method.
    fn converge_vote(
        &self,
        sessions: &[SubagentSession],
        resolution: ConflictResolution,
    ) -> DomainResult<ConvergenceResult> {
        if sessions.len() < 3 {
            return Err(DomainError::ValidationFailed(format!(
                "vote convergence requires at least 3 sessions, got {}",
                sessions.len()
            )));
        }

        let mut ballots: BTreeMap<String, (Value, Vec<&SubagentSession>)> = BTreeMap::new();
        for session in sessions {
            let payload = outcome_payload(session);
            let key = serde_json::to_string(payload)
                .map_err(|e| DomainError::SerializationError(e.to_string()))?;
            ballots
                .entry(key)
                .or_insert_with(|| (payload.clone(), Vec::new()))
                .1
                .push(session);
        }

        let majority = sessions.len() / 2 + 1;
        let top = ballots
            .values()
            .max_by_key(|(_, voters)| voters.len())
            .expect("ballots nonempty");

        if top.1.len() >= majority {
            return Ok(ConvergenceResult {
                strategy: ConvergenceStrategy::Vote,
                session_ids: sessions.iter().map(|s| s.id).collect(),
                conflicts: Vec::new(),
                resolution: None,
                payload: top.0.clone(),
            });
        }

        // No strict majority: the tied leading ballots become a conflict.
        let leading = top.1.len();
        let tied: Vec<&SubagentSession> = ballots
            .values()
            .filter(|(_, voters)| voters.len() == leading)
            .flat_map(|(_, voters)| voters.iter().copied())
            .collect();
        let conflict = Conflict {
            target: "vote".to_string(),
            session_ids: tied.iter().map(|s| s.id).collect(),
        };

        let winner = self.resolve_conflict(&tied, resolution)?;
        Ok(ConvergenceResult {
            strategy: ConvergenceStrategy::Vote,
            session_ids: sessions.iter().map(|s| s.id).collect(),
            conflicts: vec![conflict],
            resolution: Some(resolution),
            payload: outcome_payload(winner).clone(),
        })
    }

    /// Consensus: all results must match within tolerance; any disagreement
    /// rejects the convergence outright.
    fn converge_consensus(
        &self,
        sessions: &[SubagentSession],
    ) -> DomainResult<ConvergenceResult> {
        let first = outcome_payload(&sessions[0]);
        for session in &sessions[1..] {
            if !values_match(
                first,
                outcome_payload(session),
                self.config.consensus_tolerance,
            ) {
                return Err(DomainError::ManualReviewRequired(format!(
                    "session {} disagrees beyond tolerance {}",
                    session.id, self.config.consensus_tolerance
                )));
            }
        }

        Ok(ConvergenceResult {
            strategy: ConvergenceStrategy::Consensus,
            session_ids: sessions.iter().map(|s| s.id).collect(),
            conflicts: Vec::new(),
            resolution: None,
            payload: first.clone(),
        })
    }

    /// First success: the chronologically first session to reach a success
    /// terminal state wins; the rest stay in the transcript for audit.
    fn converge_first_success(
        &self,
        sessions: &[SubagentSession],
    ) -> DomainResult<ConvergenceResult> {
        let winner = sessions
            .iter()
            .filter(|s| s.state.is_success())
            .min_by_key(|s| (s.finished_at, s.id.to_string()))
            .ok_or_else(|| {
                DomainError::ValidationFailed(
                    "first_success convergence found no successful session".to_string(),
                )
            })?;

        Ok(ConvergenceResult {
            strategy: ConvergenceStrategy::FirstSuccess,
            session_ids: vec![winner.id],
            conflicts: Vec::new(),
            resolution: None,
            payload: outcome_payload(winner).clone(),
        })
    }

    /// Pick one contributor under the configured resolution method.
    ///
    /// `AutoAcceptLatest` breaks identical terminal timestamps on lexical
    /// session-id order, so the choice is deterministic.
    fn resolve_conflict<'a>(
        &self,
        contributors: &[&'a SubagentSession],
        resolution: ConflictResolution,
    ) -> DomainResult<&'a SubagentSession> {
        match resolution {
            ConflictResolution::Manual => Err(DomainError::ManualReviewRequired(format!(
                "{} conflicting contributions need external review",
                contributors.len()
            ))),
            ConflictResolution::AutoAcceptLatest => {
                let winner = contributors
                    .iter()
                    .max_by_key(|s| (s.finished_at, s.id.to_string()))
                    .expect("contributors nonempty");
                info!(session_id = %winner.id, "conflict auto-resolved to latest contributor");
                Ok(winner)
            }
            ConflictResolution::PreferHigherConfidence => {
                for session in contributors {
                    let has_confidence = session
                        .outcome
                        .as_ref()
                        .and_then(|o| o.confidence)
                        .is_some();
                    if !has_confidence {
                        return Err(DomainError::MissingConfidenceMetadata(session.id));
                    }
                }
                let winner = contributors
                    .iter()
                    .max_by(|a, b| {
                        let ca = a.outcome.as_ref().and_then(|o| o.confidence).unwrap_or(0.0);
                        let cb = b.outcome.as_ref().and_then(|o| o.confidence).unwrap_or(0.0);
                        ca.partial_cmp(&cb)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
                    })
                    .expect("contributors nonempty");
                Ok(winner)
            }
        }
    }
}

/// Shared state mutation for the spawned session future.
async fn set_state(
    registry: &Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
    session_id: Uuid,
    state: SessionState,
    outcome: Option<SubagentOutcome>,
) {
    let mut registry = registry.write().await;
    if let Some(entry) = registry.get_mut(&session_id) {
        // A cancelled session stays cancelled; the worker must not revive it.
        if entry.session.state.is_terminal() {
            return;
        }
        entry.session.state = state;
        if state.is_terminal() {
            entry.session.finished_at = Some(Utc::now());
            entry.session.outcome = outcome;
        }
        entry.state_tx.send_replace(state);
    }
}

static EMPTY_PAYLOAD: Value = Value::Null;

fn outcome_payload(session: &SubagentSession) -> &Value {
    session
        .outcome
        .as_ref()
        .map_or(&EMPTY_PAYLOAD, |o| &o.payload)
}

/// Targets a session contributes to: object payload keys, or a single
/// `"result"` target for scalar payloads.
fn contribution_targets(session: &SubagentSession) -> Vec<String> {
    match outcome_payload(session) {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => vec!["result".to_string()],
    }
}

fn contribution_value<'a>(session: &'a SubagentSession, target: &str) -> &'a Value {
    match outcome_payload(session) {
        Value::Object(map) => map.get(target).unwrap_or(&EMPTY_PAYLOAD),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::run::PermissionMode;
    use crate::infrastructure::runner::ScriptedRunner;
    use crate::infrastructure::transcript::InMemoryTranscriptStore;
    use serde_json::json;

    fn coordinator(runner: Arc<ScriptedRunner>) -> SubagentCoordinator {
        let recorder = Arc::new(TranscriptRecorder::new(Arc::new(
            InMemoryTranscriptStore::new(),
        )));
        SubagentCoordinator::new(runner as Arc<dyn SubagentRunner>, recorder, RunConfig::default())
    }

    fn run_with(mode: PermissionMode) -> TaskRun {
        TaskRun::new("objective", None, mode)
    }

    fn task(mode: PermissionMode) -> SubagentTask {
        SubagentTask::new("subtask", mode).with_timeout(5)
    }

    #[tokio::test]
    async fn test_delegate_and_handoff_success() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .push(AgentRole::Builder, SubagentOutcome::success(json!({"content": "x"})))
            .await;
        let coordinator = coordinator(runner);
        let run = run_with(PermissionMode::AcceptEdits);

        let session = coordinator
            .delegate(&run, None, AgentRole::Builder, task(PermissionMode::Plan), false)
            .await
            .unwrap();
        assert_eq!(session.state, SessionState::Spawned);
        assert_eq!(session.depth, 1);

        let finished = coordinator
            .handoff(session.id, true, 5, OnFailure::Escalate)
            .await
            .unwrap();
        assert_eq!(finished.state, SessionState::Converged);
        assert!(finished.outcome.is_some());
        assert!(finished.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_permission_escalation_denied() {
        let coordinator = coordinator(Arc::new(ScriptedRunner::new()));
        let run = run_with(PermissionMode::Plan);

        let err = coordinator
            .delegate(
                &run,
                None,
                AgentRole::Builder,
                task(PermissionMode::AcceptEdits),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::PermissionEscalationDenied { .. }));
    }

    #[tokio::test]
    async fn test_convergence_backlog_for_active_sibling() {
        let runner = Arc::new(ScriptedRunner::new().with_delay_ms(200));
        runner
            .push(AgentRole::Builder, SubagentOutcome::success(json!({})))
            .await;
        let coordinator = coordinator(runner);
        let run = run_with(PermissionMode::AcceptEdits);

        let first = coordinator
            .delegate(&run, None, AgentRole::Builder, task(PermissionMode::Plan), false)
            .await
            .unwrap();

        let err = coordinator
            .delegate(&run, None, AgentRole::Tester, task(PermissionMode::Plan), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::ConvergenceBacklog(id) if id == first.id));

        // Once the sibling is terminal the next delegation is accepted.
        coordinator
            .handoff(first.id, true, 5, OnFailure::Escalate)
            .await
            .unwrap();
        coordinator
            .delegate(&run, None, AgentRole::Tester, task(PermissionMode::Plan), false)
            .await
            .expect("delegation allowed after sibling converged");
    }

    #[tokio::test]
    async fn test_forked_sessions_exempt_from_backlog() {
        let runner = Arc::new(ScriptedRunner::new().with_delay_ms(300));
        runner
            .push(AgentRole::Builder, SubagentOutcome::success(json!({})))
            .await;
        runner
            .push(AgentRole::Builder, SubagentOutcome::success(json!({})))
            .await;
        let coordinator = coordinator(runner);
        let run = run_with(PermissionMode::AcceptEdits);

        let source = coordinator
            .delegate(&run, None, AgentRole::Builder, task(PermissionMode::Plan), false)
            .await
            .unwrap();
        let fork = coordinator.fork(&run, source.id).await.unwrap();
        assert!(fork.forked);
        assert_ne!(fork.id, source.id);
    }

    #[tokio::test]
    async fn test_forked_sessions_never_converge() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .push(AgentRole::Builder, SubagentOutcome::success(json!({})))
            .await;
        runner
            .push(AgentRole::Builder, SubagentOutcome::success(json!({})))
            .await;
        let coordinator = coordinator(runner);
        let run = run_with(PermissionMode::AcceptEdits);

        let source = coordinator
            .delegate(&run, None, AgentRole::Builder, task(PermissionMode::Plan), false)
            .await
            .unwrap();
        coordinator
            .handoff(source.id, true, 5, OnFailure::Escalate)
            .await
            .unwrap();
        let fork = coordinator.fork(&run, source.id).await.unwrap();
        coordinator
            .handoff(fork.id, true, 5, OnFailure::Escalate)
            .await
            .unwrap();

        let err = coordinator
            .converge(
                &run,
                &[fork.id],
                ConvergenceStrategy::Merge,
                ConflictResolution::Manual,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot converge"));
    }

    #[tokio::test]
    async fn test_handoff_timeout_escalates() {
        let runner = Arc::new(ScriptedRunner::new().with_delay_ms(60_000));
        runner
            .push(AgentRole::Builder, SubagentOutcome::success(json!({})))
            .await;
        let coordinator = coordinator(runner);
        let run = run_with(PermissionMode::AcceptEdits);

        let session = coordinator
            .delegate(&run, None, AgentRole::Builder, task(PermissionMode::Plan), false)
            .await
            .unwrap();
        let err = coordinator
            .handoff(session.id, true, 1, OnFailure::Escalate)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::SubagentTimeout(_)));

        let snapshot = coordinator.session(session.id).await.unwrap();
        assert_eq!(snapshot.state, SessionState::TimedOut);
    }

    #[tokio::test]
    async fn test_monitor_mode_does_not_block() {
        let runner = Arc::new(ScriptedRunner::new().with_delay_ms(60_000));
        runner
            .push(AgentRole::Builder, SubagentOutcome::success(json!({})))
            .await;
        let coordinator = coordinator(runner);
        let run = run_with(PermissionMode::AcceptEdits);

        let session = coordinator
            .delegate(&run, None, AgentRole::Builder, task(PermissionMode::Plan), false)
            .await
            .unwrap();
        let snapshot = coordinator
            .handoff(session.id, false, 1, OnFailure::Escalate)
            .await
            .unwrap();
        assert!(!snapshot.state.is_terminal());
        coordinator.cancel_run(run.id).await;
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let runner = Arc::new(ScriptedRunner::new().with_delay_ms(60_000));
        for _ in 0..3 {
            runner
                .push(AgentRole::Retriever, SubagentOutcome::success(json!({})))
                .await;
        }
        let coordinator = coordinator(runner);
        let run = run_with(PermissionMode::AcceptEdits);

        let first = coordinator
            .delegate(&run, None, AgentRole::Retriever, task(PermissionMode::Plan), false)
            .await
            .unwrap();
        let second = coordinator
            .delegate(
                &run,
                Some(first.id),
                AgentRole::Retriever,
                task(PermissionMode::Plan),
                false,
            )
            .await
            .unwrap();
        assert_eq!(second.depth, 2);

        let err = coordinator
            .delegate(
                &run,
                Some(second.id),
                AgentRole::Retriever,
                task(PermissionMode::Plan),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::DelegationDepthExceeded { depth: 3, max: 2 }));
        coordinator.cancel_run(run.id).await;
    }

    #[tokio::test]
    async fn test_cancel_run_marks_sessions_timed_out() {
        let runner = Arc::new(ScriptedRunner::new().with_delay_ms(60_000));
        runner
            .push(AgentRole::Builder, SubagentOutcome::success(json!({})))
            .await;
        let coordinator = coordinator(runner);
        let run = run_with(PermissionMode::AcceptEdits);

        let session = coordinator
            .delegate(&run, None, AgentRole::Builder, task(PermissionMode::Plan), false)
            .await
            .unwrap();
        let cancelled = coordinator.cancel_run(run.id).await;
        assert_eq!(cancelled, vec![session.id]);

        let snapshot = coordinator.session(session.id).await.unwrap();
        assert_eq!(snapshot.state, SessionState::TimedOut);
    }
}
