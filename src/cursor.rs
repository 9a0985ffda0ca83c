// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync cursors: persisted bookmarks of synchronization progress.
//!
//! A cursor marks the last record a worker pushed to a secondary tier,
//! ordered by `(updated_at, id)`. Cursors only move forward; the single
//! exception is an explicit [`CursorStore::reset`].
//!
//! [`SqliteCursorStore`] keeps them in a local SQLite file so a restarted
//! process resumes near where it stopped instead of replaying the whole
//! primary store.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use crate::record::{Record, RecordKind};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::StorageError;
use crate::tier::TierKind;

/// Position in the primary store's `(updated_at, id)` order.
///
/// Field order matters: the derived `Ord` compares `updated_at` first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncCursor {
    pub updated_at: i64,
    pub last_id: String,
}

impl SyncCursor {
    /// Position before every record.
    #[must_use]
    pub fn origin() -> Self {
        Self {
            updated_at: i64::MIN,
            last_id: String::new(),
        }
    }

    /// Position of `record`.
    #[must_use]
    pub fn at(record: &Record) -> Self {
        Self {
            updated_at: record.updated_at,
            last_id: record.id.clone(),
        }
    }

    #[must_use]
    pub fn is_origin(&self) -> bool {
        self.updated_at == i64::MIN && self.last_id.is_empty()
    }

    /// Position `window` earlier, used to re-scan late-committed writes.
    #[must_use]
    pub fn rewound_by(&self, window: Duration) -> Self {
        if self.is_origin() || window.is_zero() {
            return self.clone();
        }
        Self {
            updated_at: self.updated_at.saturating_sub(window.as_millis() as i64),
            last_id: String::new(),
        }
    }

    /// Whether `record` sorts strictly after this position.
    #[must_use]
    pub fn precedes(&self, record: &Record) -> bool {
        (record.updated_at, record.id.as_str()) > (self.updated_at, self.last_id.as_str())
    }
}

impl Default for SyncCursor {
    fn default() -> Self {
        Self::origin()
    }
}

/// Persistence for per-(tier, kind) cursors.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Stored cursor, or [`SyncCursor::origin`] if none was saved yet.
    async fn load(&self, tier: TierKind, kind: &RecordKind) -> Result<SyncCursor, StorageError>;

    /// Move the cursor forward to `to`. Older positions are ignored.
    ///
    /// Returns the cursor now stored.
    async fn advance(&self, tier: TierKind, kind: &RecordKind, to: &SyncCursor) -> Result<SyncCursor, StorageError>;

    /// Forget the cursor so the next cycle replays from the origin.
    async fn reset(&self, tier: TierKind, kind: &RecordKind) -> Result<(), StorageError>;
}

/// In-process cursor store (tests, single-run tools).
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: DashMap<(TierKind, String), SyncCursor>,
}

impl MemoryCursorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, tier: TierKind, kind: &RecordKind) -> Result<SyncCursor, StorageError> {
        Ok(self
            .cursors
            .get(&(tier, kind.to_string()))
            .map(|c| c.value().clone())
            .unwrap_or_default())
    }

    async fn advance(&self, tier: TierKind, kind: &RecordKind, to: &SyncCursor) -> Result<SyncCursor, StorageError> {
        let mut entry = self.cursors.entry((tier, kind.to_string())).or_default();
        if *to > *entry {
            *entry = to.clone();
        }
        Ok(entry.clone())
    }

    async fn reset(&self, tier: TierKind, kind: &RecordKind) -> Result<(), StorageError> {
        self.cursors.remove(&(tier, kind.to_string()));
        Ok(())
    }
}

/// Cursor store backed by a local SQLite file.
pub struct SqliteCursorStore {
    pool: AnyPool,
    path: String,
}

impl SqliteCursorStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        crate::storage::sql::install_drivers();

        let path_str = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path_str);
        info!(path = %path_str, "Opening sync cursor store");

        let pool = retry("cursor_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(2)
                .connect(&url)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, path: path_str };
        store.init_schema().await?;
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_cursors (
                tier TEXT NOT NULL,
                kind TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                last_id TEXT NOT NULL,
                PRIMARY KEY (tier, kind)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("Failed to create cursor table: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn load(&self, tier: TierKind, kind: &RecordKind) -> Result<SyncCursor, StorageError> {
        let row = sqlx::query("SELECT updated_at, last_id FROM sync_cursors WHERE tier = ? AND kind = ?")
            .bind(tier.as_str())
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => Ok(SyncCursor {
                updated_at: row.try_get("updated_at").map_err(|e| StorageError::Backend(e.to_string()))?,
                last_id: row.try_get("last_id").map_err(|e| StorageError::Backend(e.to_string()))?,
            }),
            None => Ok(SyncCursor::origin()),
        }
    }

    async fn advance(&self, tier: TierKind, kind: &RecordKind, to: &SyncCursor) -> Result<SyncCursor, StorageError> {
        // The WHERE clause on the upsert keeps the stored cursor monotonic.
        sqlx::query(
            "INSERT INTO sync_cursors (tier, kind, updated_at, last_id) VALUES (?, ?, ?, ?)
             ON CONFLICT(tier, kind) DO UPDATE SET
                updated_at = excluded.updated_at,
                last_id = excluded.last_id
             WHERE excluded.updated_at > sync_cursors.updated_at
                OR (excluded.updated_at = sync_cursors.updated_at AND excluded.last_id > sync_cursors.last_id)",
        )
        .bind(tier.as_str())
        .bind(kind.as_str())
        .bind(to.updated_at)
        .bind(&to.last_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("Failed to persist cursor: {}", e)))?;

        debug!(tier = %tier, kind = %kind, updated_at = to.updated_at, last_id = %to.last_id, "Cursor advanced");
        self.load(tier, kind).await
    }

    async fn reset(&self, tier: TierKind, kind: &RecordKind) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sync_cursors WHERE tier = ? AND kind = ?")
            .bind(tier.as_str())
            .bind(kind.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        info!(tier = %tier, kind = %kind, "Sync cursor reset");
        Ok(())
    }
}
