//! In-memory transcript store for tests and ephemeral runs.

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::models::event::{SequenceNumber, TranscriptEvent};
use crate::domain::ports::{TranscriptStore, TranscriptStoreError};

/// Append-only in-memory event store.
#[derive(Debug, Default)]
pub struct InMemoryTranscriptStore {
    events: RwLock<Vec<TranscriptEvent>>,
}

impl InMemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscriptStore {
    async fn append(&self, event: &TranscriptEvent) -> Result<(), TranscriptStoreError> {
        let mut events = self.events.write().await;
        events.push(event.clone());
        Ok(())
    }

    async fn read(
        &self,
        run_id: Uuid,
        from: SequenceNumber,
    ) -> Result<Vec<TranscriptEvent>, TranscriptStoreError> {
        let events = self.events.read().await;
        let mut result: Vec<TranscriptEvent> = events
            .iter()
            .filter(|e| e.run_id == run_id && e.sequence >= from)
            .cloned()
            .collect();
        result.sort_by_key(|e| e.sequence);
        Ok(result)
    }

    async fn latest_sequence(
        &self,
        run_id: Uuid,
    ) -> Result<Option<SequenceNumber>, TranscriptStoreError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.run_id == run_id)
            .map(|e| e.sequence)
            .max())
    }
}
