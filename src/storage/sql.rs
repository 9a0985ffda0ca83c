// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend for the primary tier.
//!
//! One table per record kind, named after the kind:
//! ```sql
//! CREATE TABLE citizens (
//!   id VARCHAR(255) PRIMARY KEY,
//!   version BIGINT NOT NULL,
//!   payload LONGTEXT NOT NULL,   -- JSON as text
//!   updated_at BIGINT NOT NULL   -- epoch millis, drives the sync scan order
//! )
//! ```
//!
//! Optimistic concurrency is a conditional update:
//! ```sql
//! UPDATE citizens SET version = version + 1, payload = ?, updated_at = ?
//!  WHERE id = ? AND version = ?
//! ```
//! Zero affected rows means either the record is gone (`NotFound`) or
//! another writer got there first (`Conflict`).
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver does not rewrite placeholders, so Postgres needs `$n`
//! where SQLite and MySQL take `?`; [`SqlDialect::param`] hides that. MySQL
//! LONGTEXT may come back as bytes, hence [`text_column`].

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use super::traits::{PrimaryStore, StorageError};
use crate::cursor::SyncCursor;
use crate::record::{Record, RecordKind, WriteClock};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    MySql,
    Postgres,
}

impl SqlDialect {
    pub fn from_url(url: &str) -> Result<Self, StorageError> {
        if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else if url.starts_with("mysql:") || url.starts_with("mariadb:") {
            Ok(Self::MySql)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(Self::Postgres)
        } else {
            Err(StorageError::Backend(format!("Unsupported SQL URL scheme: {}", url)))
        }
    }

    /// Placeholder for the `n`th (1-based) bind parameter.
    #[must_use]
    pub fn param(self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${}", n),
            Self::Sqlite | Self::MySql => "?".to_string(),
        }
    }

    pub(crate) fn id_column(self) -> &'static str {
        match self {
            Self::MySql => "VARCHAR(255)",
            Self::Sqlite | Self::Postgres => "TEXT",
        }
    }

    pub(crate) fn text_column(self) -> &'static str {
        match self {
            Self::MySql => "LONGTEXT",
            Self::Sqlite | Self::Postgres => "TEXT",
        }
    }
}

/// Connect an `Any` pool with startup-mode retry (fails fast if config is wrong).
pub async fn connect_pool(url: &str, max_connections: u32) -> Result<(AnyPool, SqlDialect), StorageError> {
    install_drivers();
    let dialect = SqlDialect::from_url(url)?;

    let pool = retry("sql_connect", &RetryConfig::startup(), || async {
        AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect(url)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    })
    .await?;

    if dialect == SqlDialect::Sqlite {
        // Readers don't block the writer in WAL mode
        for pragma in ["PRAGMA journal_mode = WAL", "PRAGMA synchronous = NORMAL"] {
            sqlx::query(pragma)
                .execute(&pool)
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to apply '{}': {}", pragma, e)))?;
        }
    }

    Ok((pool, dialect))
}

/// Read a text column that may arrive as a string or as raw bytes.
pub(crate) fn text_column(row: &AnyRow, name: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(name)
        .or_else(|_| {
            row.try_get::<Vec<u8>, _>(name)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        })
        .map_err(|e| StorageError::Backend(format!("Column '{}': {}", name, e)))
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub struct SqlPrimaryStore {
    pool: AnyPool,
    dialect: SqlDialect,
    kind: RecordKind,
    clock: WriteClock,
}

impl SqlPrimaryStore {
    /// Connect and create the kind's table if needed.
    pub async fn connect(connection_string: &str, kind: RecordKind) -> Result<Self, StorageError> {
        let (pool, dialect) = connect_pool(connection_string, 20).await?;
        Self::from_pool(pool, dialect, kind).await
    }

    /// Share an existing pool (e.g. with the document tier).
    pub async fn from_pool(pool: AnyPool, dialect: SqlDialect, kind: RecordKind) -> Result<Self, StorageError> {
        let store = Self {
            pool,
            dialect,
            kind,
            clock: WriteClock::default(),
        };
        store.init_schema().await?;
        info!(kind = %store.kind, dialect = ?store.dialect, "SQL primary store ready");
        Ok(store)
    }

    #[must_use]
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    #[must_use]
    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    #[must_use]
    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let table = self.kind.as_str();
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id {id_type} PRIMARY KEY,
                version BIGINT NOT NULL,
                payload {text_type} NOT NULL,
                updated_at BIGINT NOT NULL
            )",
            id_type = self.dialect.id_column(),
            text_type = self.dialect.text_column(),
        );
        // MySQL has no CREATE INDEX IF NOT EXISTS; a duplicate index error is expected on restart.
        let index = match self.dialect {
            SqlDialect::MySql => format!("CREATE INDEX idx_{table}_updated ON {table} (updated_at, id)"),
            SqlDialect::Sqlite | SqlDialect::Postgres => {
                format!("CREATE INDEX IF NOT EXISTS idx_{table}_updated ON {table} (updated_at, id)")
            }
        };

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(&create).execute(&self.pool).await.map_err(backend)
        })
        .await?;

        if let Err(e) = sqlx::query(&index).execute(&self.pool).await {
            if self.dialect != SqlDialect::MySql {
                return Err(backend(e));
            }
            debug!(error = %e, "Scan index already present");
        }
        Ok(())
    }

    fn row_to_record(row: &AnyRow) -> Result<Record, StorageError> {
        let id = text_column(row, "id")?;
        let version: i64 = row.try_get("version").map_err(backend)?;
        let updated_at: i64 = row.try_get("updated_at").map_err(backend)?;
        let payload_text = text_column(row, "payload")?;
        let payload = serde_json::from_str(&payload_text)
            .map_err(|e| StorageError::Serialization(format!("Invalid payload for '{}': {}", id, e)))?;
        Ok(Record::reconstruct(id, version.max(0) as u64, updated_at, payload))
    }

    fn encode_payload(record: &Record) -> Result<String, StorageError> {
        serde_json::to_string(&record.payload).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl PrimaryStore for SqlPrimaryStore {
    async fn get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        let sql = format!(
            "SELECT id, version, payload, updated_at FROM {} WHERE id = {}",
            self.kind,
            self.dialect.param(1)
        );

        retry("sql_get", &RetryConfig::query(), || async {
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
            row.as_ref().map(Self::row_to_record).transpose()
        })
        .await
    }

    // Writes are not retried: a lost acknowledgement would turn into a spurious conflict.
    async fn add(&self, record: &Record) -> Result<Record, StorageError> {
        let d = self.dialect;
        let sql = format!(
            "INSERT INTO {} (id, version, payload, updated_at) VALUES ({}, {}, {}, {})",
            self.kind,
            d.param(1),
            d.param(2),
            d.param(3),
            d.param(4)
        );
        let stored = Record::reconstruct(
            record.id.clone(),
            record.version.max(1),
            self.clock.stamp(),
            record.payload.clone(),
        );
        let payload = Self::encode_payload(&stored)?;

        sqlx::query(&sql)
            .bind(&stored.id)
            .bind(stored.version as i64)
            .bind(&payload)
            .bind(stored.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StorageError::AlreadyExists { id: stored.id.clone() }
                } else {
                    backend(e)
                }
            })?;

        Ok(stored)
    }

    async fn update(&self, record: &Record) -> Result<Record, StorageError> {
        let d = self.dialect;
        let sql = format!(
            "UPDATE {} SET version = version + 1, payload = {}, updated_at = {} WHERE id = {} AND version = {}",
            self.kind,
            d.param(1),
            d.param(2),
            d.param(3),
            d.param(4)
        );
        let payload = Self::encode_payload(record)?;
        let updated_at = self.clock.stamp();

        let result = sqlx::query(&sql)
            .bind(&payload)
            .bind(updated_at)
            .bind(&record.id)
            .bind(record.version as i64)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 1 {
            return Ok(Record::reconstruct(
                record.id.clone(),
                record.version + 1,
                updated_at,
                record.payload.clone(),
            ));
        }

        match self.get(&record.id).await? {
            None => Err(StorageError::NotFound),
            Some(current) => Err(StorageError::Conflict {
                id: record.id.clone(),
                expected: record.version,
                actual: current.version,
            }),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let sql = format!("DELETE FROM {} WHERE id = {}", self.kind, self.dialect.param(1));
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn scan_since(&self, cursor: &SyncCursor, limit: usize) -> Result<Vec<Record>, StorageError> {
        let d = self.dialect;
        let sql = format!(
            "SELECT id, version, payload, updated_at FROM {} \
             WHERE updated_at > {} OR (updated_at = {} AND id > {}) \
             ORDER BY updated_at, id LIMIT {}",
            self.kind,
            d.param(1),
            d.param(2),
            d.param(3),
            limit
        );

        retry("sql_scan_since", &RetryConfig::query(), || async {
            let rows = sqlx::query(&sql)
                .bind(cursor.updated_at)
                .bind(cursor.updated_at)
                .bind(&cursor.last_id)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
            rows.iter().map(Self::row_to_record).collect()
        })
        .await
    }

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        let sql = format!("SELECT 1 AS present FROM {} WHERE id = {} LIMIT 1", self.kind, self.dialect.param(1));
        retry("sql_exists", &RetryConfig::query(), || async {
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
            Ok(row.is_some())
        })
        .await
    }

    async fn list(&self, offset: u64, limit: usize) -> Result<Vec<Record>, StorageError> {
        let sql = format!(
            "SELECT id, version, payload, updated_at FROM {} ORDER BY id LIMIT {} OFFSET {}",
            self.kind, limit, offset
        );
        retry("sql_list", &RetryConfig::query(), || async {
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(backend)?;
            rows.iter().map(Self::row_to_record).collect()
        })
        .await
    }

    async fn count_all(&self) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) AS cnt FROM {}", self.kind);
        retry("sql_count", &RetryConfig::query(), || async {
            let row = sqlx::query(&sql).fetch_one(&self.pool).await.map_err(backend)?;
            let count: i64 = row.try_get("cnt").map_err(backend)?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}
