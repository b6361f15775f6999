//! SQLite playbook store.
//!
//! The optimistic version check and the write happen inside one transaction,
//! so a concurrent writer observes either the old version or the new one,
//! never a torn state. WAL mode keeps concurrent readers cheap.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;

use crate::domain::models::DatabaseConfig;
use crate::domain::ports::{PlaybookEntry, PlaybookError, PlaybookStore, VersionedEntry};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS playbook_entries (
    key TEXT PRIMARY KEY,
    strategy TEXT NOT NULL,
    helpful_count INTEGER NOT NULL DEFAULT 0,
    harmful_count INTEGER NOT NULL DEFAULT 0,
    tags TEXT NOT NULL DEFAULT '[]',
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
)
";

/// SQLite-backed playbook store.
pub struct SqlitePlaybookStore {
    pool: SqlitePool,
}

impl SqlitePlaybookStore {
    /// Open (creating if missing) the database at the configured path and
    /// run the schema migration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, PlaybookError> {
        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PlaybookError::Unavailable(e.to_string()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path))
            .map_err(|e| PlaybookError::Unavailable(format!("invalid database path: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(unavailable)?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(unavailable)?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool; the caller owns migration. Test helper.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn unavailable(err: sqlx::Error) -> PlaybookError {
    PlaybookError::Unavailable(err.to_string())
}

fn row_to_versioned(row: &sqlx::sqlite::SqliteRow) -> Result<VersionedEntry, PlaybookError> {
    let tags_json: String = row.try_get("tags").map_err(unavailable)?;
    let tags: BTreeSet<String> = serde_json::from_str(&tags_json)
        .map_err(|e| PlaybookError::Serialization(e.to_string()))?;
    let helpful: i64 = row.try_get("helpful_count").map_err(unavailable)?;
    let harmful: i64 = row.try_get("harmful_count").map_err(unavailable)?;
    let version: i64 = row.try_get("version").map_err(unavailable)?;

    Ok(VersionedEntry {
        entry: PlaybookEntry {
            strategy: row.try_get("strategy").map_err(unavailable)?,
            helpful_count: u32::try_from(helpful).unwrap_or(0),
            harmful_count: u32::try_from(harmful).unwrap_or(0),
            tags,
        },
        version: u64::try_from(version).unwrap_or(0),
    })
}

#[async_trait]
impl PlaybookStore for SqlitePlaybookStore {
    async fn read(&self, key: &str) -> Result<Option<VersionedEntry>, PlaybookError> {
        let row = sqlx::query(
            "SELECT strategy, helpful_count, harmful_count, tags, version
             FROM playbook_entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.as_ref().map(row_to_versioned).transpose()
    }

    async fn write(
        &self,
        key: &str,
        entry: PlaybookEntry,
        expected_version: u64,
    ) -> Result<u64, PlaybookError> {
        let tags_json = serde_json::to_string(&entry.tags)
            .map_err(|e| PlaybookError::Serialization(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let current: i64 = sqlx::query("SELECT version FROM playbook_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?
            .map(|row| row.try_get("version"))
            .transpose()
            .map_err(unavailable)?
            .unwrap_or(0);

        let expected = i64::try_from(expected_version).unwrap_or(i64::MAX);
        if current != expected {
            return Err(PlaybookError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                found: u64::try_from(current).unwrap_or(0),
            });
        }

        let new_version = current + 1;
        sqlx::query(
            "INSERT INTO playbook_entries
                 (key, strategy, helpful_count, harmful_count, tags, version, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                 strategy = excluded.strategy,
                 helpful_count = excluded.helpful_count,
                 harmful_count = excluded.harmful_count,
                 tags = excluded.tags,
                 version = excluded.version,
                 updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(&entry.strategy)
        .bind(i64::from(entry.helpful_count))
        .bind(i64::from(entry.harmful_count))
        .bind(&tags_json)
        .bind(new_version)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(u64::try_from(new_version).unwrap_or(0))
    }

    async fn remove(&self, key: &str, expected_version: u64) -> Result<(), PlaybookError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let current: Option<i64> =
            sqlx::query("SELECT version FROM playbook_entries WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?
                .map(|row| row.try_get("version"))
                .transpose()
                .map_err(unavailable)?;

        let Some(current) = current else {
            return Err(PlaybookError::NotFound(key.to_string()));
        };

        if current != i64::try_from(expected_version).unwrap_or(i64::MAX) {
            return Err(PlaybookError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                found: u64::try_from(current).unwrap_or(0),
            });
        }

        sqlx::query("DELETE FROM playbook_entries WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, PlaybookError> {
        let rows = sqlx::query("SELECT key FROM playbook_entries ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        rows.iter()
            .map(|row| row.try_get("key").map_err(unavailable))
            .collect()
    }
}
