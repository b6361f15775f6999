//! Playbook store port.
//!
//! The playbook is the one piece of mutable shared state in the system. The
//! store contract is optimistic: writers supply the version they last read,
//! and a mismatch is a conflict, never a silent overwrite. Only the delta
//! governor calls `write`/`remove`.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One curated strategy entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybookEntry {
    /// The strategy text.
    pub strategy: String,
    /// Times the entry was marked helpful by reflection.
    #[serde(default)]
    pub helpful_count: u32,
    /// Times the entry was marked harmful.
    #[serde(default)]
    pub harmful_count: u32,
    /// Free-form tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl PlaybookEntry {
    pub fn new(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            helpful_count: 0,
            harmful_count: 0,
            tags: BTreeSet::new(),
        }
    }

    /// Net helpful-minus-harmful score.
    pub fn net_score(&self) -> i64 {
        i64::from(self.helpful_count) - i64::from(self.harmful_count)
    }
}

/// A versioned entry as returned by reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedEntry {
    pub entry: PlaybookEntry,
    /// Monotonic per-key version; 0 means absent, first write produces 1.
    pub version: u64,
}

/// Error type for playbook store operations.
#[derive(Debug, Error)]
pub enum PlaybookError {
    #[error("Version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Playbook storage unavailable: {0}")]
    Unavailable(String),

    #[error("Playbook serialization error: {0}")]
    Serialization(String),
}

/// Read-only snapshot of the whole playbook, used to build the inherited
/// context handed to delegated agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybookSnapshot {
    pub entries: BTreeMap<String, PlaybookEntry>,
}

impl PlaybookSnapshot {
    /// Render a compact context summary: top strategies by net score with
    /// their helpful/harmful counters.
    pub fn to_context_summary(&self, max_entries: usize) -> String {
        let mut ranked: Vec<(&String, &PlaybookEntry)> = self.entries.iter().collect();
        ranked.sort_by_key(|(_, e)| std::cmp::Reverse(e.net_score()));

        let mut lines = vec![
            "# Playbook Context".to_string(),
            String::new(),
            "Strategies learned through previous task adaptations:".to_string(),
            String::new(),
        ];
        for (i, (key, entry)) in ranked.iter().take(max_entries).enumerate() {
            lines.push(format!(
                "{}. [{}] {} [+{}/-{}]",
                i + 1,
                key,
                entry.strategy,
                entry.helpful_count,
                entry.harmful_count
            ));
        }
        lines.join("\n")
    }
}

/// Persistent store of curated playbook entries with optimistic concurrency.
#[async_trait]
pub trait PlaybookStore: Send + Sync {
    /// Read an entry with its current version; `None` when absent.
    async fn read(&self, key: &str) -> Result<Option<VersionedEntry>, PlaybookError>;

    /// Write an entry, expecting the current version to equal
    /// `expected_version` (0 for an insert). Returns the new version.
    async fn write(
        &self,
        key: &str,
        entry: PlaybookEntry,
        expected_version: u64,
    ) -> Result<u64, PlaybookError>;

    /// Remove an entry under the same optimistic contract.
    async fn remove(&self, key: &str, expected_version: u64) -> Result<(), PlaybookError>;

    /// All entry keys.
    async fn keys(&self) -> Result<Vec<String>, PlaybookError>;

    /// Snapshot the full playbook for context building.
    async fn snapshot(&self) -> Result<PlaybookSnapshot, PlaybookError> {
        let mut entries = BTreeMap::new();
        for key in self.keys().await? {
            if let Some(versioned) = self.read(&key).await? {
                entries.insert(key, versioned.entry);
            }
        }
        Ok(PlaybookSnapshot { entries })
    }
}
