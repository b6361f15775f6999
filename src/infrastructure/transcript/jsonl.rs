//! JSONL transcript store.
//!
//! One newline-delimited JSON file per run, one event per line, append-only.
//! A consumer may resume reading from the last sequence number it has seen.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::models::event::{SequenceNumber, TranscriptEvent};
use crate::domain::ports::{TranscriptStore, TranscriptStoreError};

/// File-backed transcript store rooted at a directory.
#[derive(Debug, Clone)]
pub struct JsonlTranscriptStore {
    dir: PathBuf,
}

impl JsonlTranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of a run's transcript file.
    pub fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.jsonl"))
    }

    async fn ensure_dir(&self) -> Result<(), TranscriptStoreError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| unavailable(&self.dir, &e))
    }
}

fn unavailable(path: &Path, err: &std::io::Error) -> TranscriptStoreError {
    TranscriptStoreError::Unavailable(format!("{}: {err}", path.display()))
}

#[async_trait]
impl TranscriptStore for JsonlTranscriptStore {
    async fn append(&self, event: &TranscriptEvent) -> Result<(), TranscriptStoreError> {
        self.ensure_dir().await?;
        let path = self.path_for(event.run_id);

        let mut line = serde_json::to_string(event)
            .map_err(|e| TranscriptStoreError::Serialization(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| unavailable(&path, &e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| unavailable(&path, &e))?;
        file.flush().await.map_err(|e| unavailable(&path, &e))?;
        Ok(())
    }

    async fn read(
        &self,
        run_id: Uuid,
        from: SequenceNumber,
    ) -> Result<Vec<TranscriptEvent>, TranscriptStoreError> {
        let path = self.path_for(run_id);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable(&path, &e)),
        };

        let mut events = Vec::new();
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| unavailable(&path, &e))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let event: TranscriptEvent = serde_json::from_str(&line)
                .map_err(|e| TranscriptStoreError::Serialization(e.to_string()))?;
            if event.sequence >= from {
                events.push(event);
            }
        }
        Ok(events)
    }
}
