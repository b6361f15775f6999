//! Transcript persistence port.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::event::{SequenceNumber, TranscriptEvent};

/// Error type for transcript store operations.
#[derive(Debug, Error)]
pub enum TranscriptStoreError {
    /// The backing store cannot be written or read. Fatal to the current
    /// phase; callers must never drop this silently.
    #[error("Transcript storage unavailable: {0}")]
    Unavailable(String),

    #[error("Transcript serialization error: {0}")]
    Serialization(String),
}

/// Append-only storage for transcript events.
///
/// Implementations only persist; ordering and sequence assignment are the
/// recorder's job. `append` must be durable before returning.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Persist one event.
    async fn append(&self, event: &TranscriptEvent) -> Result<(), TranscriptStoreError>;

    /// Read events for a run with sequence `>= from`, ordered by sequence.
    async fn read(
        &self,
        run_id: Uuid,
        from: SequenceNumber,
    ) -> Result<Vec<TranscriptEvent>, TranscriptStoreError>;

    /// Highest sequence number stored for a run, `None` when empty.
    async fn latest_sequence(
        &self,
        run_id: Uuid,
    ) -> Result<Option<SequenceNumber>, TranscriptStoreError> {
        let events = self.read(run_id, SequenceNumber(0)).await?;
        Ok(events.last().map(|e| e.sequence))
    }
}
