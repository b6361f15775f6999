//! In-memory playbook store for tests and dry runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::ports::{PlaybookEntry, PlaybookError, PlaybookStore, VersionedEntry};

/// Versioned in-memory playbook.
#[derive(Debug, Default)]
pub struct InMemoryPlaybookStore {
    entries: RwLock<HashMap<String, VersionedEntry>>,
}

impl InMemoryPlaybookStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry at version 1, replacing whatever is there. Test helper.
    pub async fn seed(&self, key: &str, entry: PlaybookEntry) {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), VersionedEntry { entry, version: 1 });
    }
}

#[async_trait]
impl PlaybookStore for InMemoryPlaybookStore {
    async fn read(&self, key: &str) -> Result<Option<VersionedEntry>, PlaybookError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).cloned())
    }

    async fn write(
        &self,
        key: &str,
        entry: PlaybookEntry,
        expected_version: u64,
    ) -> Result<u64, PlaybookError> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key).map_or(0, |v| v.version);
        if current != expected_version {
            return Err(PlaybookError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                found: current,
            });
        }
        let version = current + 1;
        entries.insert(key.to_string(), VersionedEntry { entry, version });
        Ok(version)
    }

    async fn remove(&self, key: &str, expected_version: u64) -> Result<(), PlaybookError> {
        let mut entries = self.entries.write().await;
        let current = entries
            .get(key)
            .map(|v| v.version)
            .ok_or_else(|| PlaybookError::NotFound(key.to_string()))?;
        if current != expected_version {
            return Err(PlaybookError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                found: current,
            });
        }
        entries.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, PlaybookError> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
