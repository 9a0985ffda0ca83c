// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document tier on a SQL collection table.
//!
//! Each record kind gets its own collection, `{kind}_documents`, keyed by the
//! record id. The stored body is the denormalized document:
//! ```json
//! {"_id": "abc", "version": 2, "updated_at": 1767084657058, "payload": {...}}
//! ```
//! Writes are upserts (last write wins). The version and timestamp are
//! duplicated into columns so operators can query staleness without parsing
//! the body.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::AnyPool;
use tracing::debug;

use super::sql::{connect_pool, text_column, SqlDialect};
use super::traits::{SecondaryStore, StorageError};
use crate::record::{Record, RecordKind};
use crate::resilience::retry::{retry, RetryConfig};
use crate::tier::TierKind;

/// Denormalized document body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentBody {
    #[serde(rename = "_id")]
    pub id: String,
    pub version: u64,
    pub updated_at: i64,
    pub payload: Value,
}

impl DocumentBody {
    #[must_use]
    pub fn from_record(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            version: record.version,
            updated_at: record.updated_at,
            payload: record.payload.clone(),
        }
    }

    #[must_use]
    pub fn into_record(self) -> Record {
        Record::reconstruct(self.id, self.version, self.updated_at, self.payload)
    }
}

pub struct SqlDocumentStore {
    pool: AnyPool,
    dialect: SqlDialect,
    collection: String,
}

impl SqlDocumentStore {
    pub async fn connect(connection_string: &str, kind: &RecordKind) -> Result<Self, StorageError> {
        let (pool, dialect) = connect_pool(connection_string, 10).await?;
        Self::from_pool(pool, dialect, kind).await
    }

    pub async fn from_pool(pool: AnyPool, dialect: SqlDialect, kind: &RecordKind) -> Result<Self, StorageError> {
        let store = Self {
            pool,
            dialect,
            collection: format!("{}_documents", kind),
        };
        store.init_schema().await?;
        Ok(store)
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id {} PRIMARY KEY,
                version BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                document {} NOT NULL,
                expires_at BIGINT
            )",
            self.collection,
            self.dialect.id_column(),
            self.dialect.text_column(),
        );
        retry("document_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;
        Ok(())
    }

    fn upsert_sql(&self) -> String {
        let d = self.dialect;
        let values = (1..=5).map(|n| d.param(n)).collect::<Vec<_>>().join(", ");
        match d {
            SqlDialect::MySql => format!(
                "INSERT INTO {} (id, version, updated_at, document, expires_at) VALUES ({})
                 ON DUPLICATE KEY UPDATE
                    version = VALUES(version),
                    updated_at = VALUES(updated_at),
                    document = VALUES(document),
                    expires_at = VALUES(expires_at)",
                self.collection, values
            ),
            SqlDialect::Sqlite | SqlDialect::Postgres => format!(
                "INSERT INTO {} (id, version, updated_at, document, expires_at) VALUES ({})
                 ON CONFLICT(id) DO UPDATE SET
                    version = excluded.version,
                    updated_at = excluded.updated_at,
                    document = excluded.document,
                    expires_at = excluded.expires_at",
                self.collection, values
            ),
        }
    }

    fn unavailable(e: impl std::fmt::Display) -> StorageError {
        StorageError::unavailable(TierKind::Document, e)
    }
}

#[async_trait]
impl SecondaryStore for SqlDocumentStore {
    fn tier(&self) -> TierKind {
        TierKind::Document
    }

    async fn try_get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        let d = self.dialect;
        // Expired documents read as a miss; the sync worker overwrites them later.
        let sql = format!(
            "SELECT document FROM {} WHERE id = {} AND (expires_at IS NULL OR expires_at > {})",
            self.collection,
            d.param(1),
            d.param(2)
        );
        let now = crate::record::now_millis();

        let row = retry("document_get", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(id)
                .bind(now)
                .fetch_optional(&self.pool)
                .await
                .map_err(Self::unavailable)
        })
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let text = text_column(&row, "document")?;
                let body: DocumentBody = serde_json::from_str(&text)
                    .map_err(|e| StorageError::Serialization(format!("Invalid document '{}': {}", id, e)))?;
                Ok(Some(body.into_record()))
            }
        }
    }

    async fn put(&self, record: &Record, ttl: Option<Duration>) -> Result<(), StorageError> {
        let sql = self.upsert_sql();
        let document = serde_json::to_string(&DocumentBody::from_record(record))
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let expires_at = ttl.map(|t| crate::record::now_millis() + t.as_millis() as i64);

        retry("document_put", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(&record.id)
                .bind(record.version as i64)
                .bind(record.updated_at)
                .bind(&document)
                .bind(expires_at)
                .execute(&self.pool)
                .await
                .map_err(Self::unavailable)?;
            Ok(())
        })
        .await?;

        debug!(collection = %self.collection, id = %record.id, version = record.version, "Document stored");
        Ok(())
    }

    async fn invalidate(&self, id: &str) -> Result<(), StorageError> {
        let sql = format!("DELETE FROM {} WHERE id = {}", self.collection, self.dialect.param(1));
        retry("document_invalidate", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(Self::unavailable)?;
            Ok(())
        })
        .await
    }
}
