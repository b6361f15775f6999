//! Transcript recorder service.
//!
//! Sole writer to the transcript. Sequence assignment is atomic with the
//! append: concurrent appends from phases and subagents serialize through a
//! per-run lock into a single total order. Relative order of events from
//! different subagents is arrival order, not a logical per-subagent order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::event::{EventDraft, SequenceNumber, TranscriptEvent};
use crate::domain::ports::{TranscriptStore, TranscriptStoreError};

/// Per-run append cursor. Holding the cursor lock across sequence assignment
/// and the store append is what makes the two atomic.
struct RunCursor {
    next: SequenceNumber,
}

/// Append-only, ordered event log for task runs.
pub struct TranscriptRecorder {
    store: Arc<dyn TranscriptStore>,
    cursors: Mutex<HashMap<Uuid, Arc<Mutex<RunCursor>>>>,
}

impl TranscriptRecorder {
    pub fn new(store: Arc<dyn TranscriptStore>) -> Self {
        Self {
            store,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Append an event, assigning the next sequence number for the run.
    ///
    /// Returns the persisted event. Fails with `StorageUnavailable` when the
    /// backing store cannot be written; callers must treat that as fatal to
    /// the current phase.
    #[instrument(skip(self, draft), fields(run_id = %run_id, kind = %draft.kind), err)]
    pub async fn append(
        &self,
        run_id: Uuid,
        draft: EventDraft,
    ) -> DomainResult<TranscriptEvent> {
        let cursor = self.cursor_for(run_id).await?;
        let mut cursor = cursor.lock().await;

        let event = TranscriptEvent {
            sequence: cursor.next,
            run_id,
            subagent_id: draft.subagent_id,
            timestamp: Utc::now(),
            kind: draft.kind,
            payload: draft.payload,
        };

        self.store
            .append(&event)
            .await
            .map_err(map_store_error)?;

        cursor.next = cursor.next.next();
        Ok(event)
    }

    /// Read events for a run from a sequence number onward, in order.
    ///
    /// Restartable: a consumer that saw up to sequence `n` resumes with
    /// `from = n + 1`.
    #[instrument(skip(self), err)]
    pub async fn read(
        &self,
        run_id: Uuid,
        from: SequenceNumber,
    ) -> DomainResult<Vec<TranscriptEvent>> {
        self.store.read(run_id, from).await.map_err(map_store_error)
    }

    /// Highest sequence number recorded for a run.
    pub async fn latest_sequence(&self, run_id: Uuid) -> DomainResult<Option<SequenceNumber>> {
        self.store
            .latest_sequence(run_id)
            .await
            .map_err(map_store_error)
    }

    /// Fetch or create the per-run cursor, seeding it from the store so a
    /// recorder restarted over an existing transcript continues the sequence
    /// without gaps or reuse.
    async fn cursor_for(&self, run_id: Uuid) -> DomainResult<Arc<Mutex<RunCursor>>> {
        let mut cursors = self.cursors.lock().await;
        if let Some(cursor) = cursors.get(&run_id) {
            return Ok(Arc::clone(cursor));
        }

        let next = match self
            .store
            .latest_sequence(run_id)
            .await
            .map_err(map_store_error)?
        {
            Some(latest) => latest.next(),
            None => SequenceNumber(0),
        };

        let cursor = Arc::new(Mutex::new(RunCursor { next }));
        cursors.insert(run_id, Arc::clone(&cursor));
        Ok(cursor)
    }
}

fn map_store_error(err: TranscriptStoreError) -> DomainError {
    match err {
        TranscriptStoreError::Unavailable(msg) => DomainError::StorageUnavailable(msg),
        TranscriptStoreError::Serialization(msg) => DomainError::SerializationError(msg),
    }
}
