// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis storage backend for the cache tier.
//!
//! Keys are namespaced as `{prefix}{kind}:{id}:record` and hold the JSON
//! encoding of the [`Record`]. Entries carry an optional TTL (`SET .. EX`).
//! Invalidation is a plain `DEL`, which Redis treats as a no-op for absent keys.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::debug;

use super::traits::{SecondaryStore, StorageError};
use crate::record::{Record, RecordKind};
use crate::resilience::retry::{retry, RetryConfig};
use crate::tier::TierKind;

pub struct RedisCacheStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "myapp:" → "myapp:citizens:abc:record")
    prefix: String,
    kind: RecordKind,
}

impl RedisCacheStore {
    pub async fn new(connection_string: &str, kind: RecordKind) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None, kind).await
    }

    /// Create a store whose keys start with `prefix`, for sharing a Redis
    /// instance with other applications.
    ///
    /// ```rust,no_run
    /// # use tier_sync::storage::redis::RedisCacheStore;
    /// # use tier_sync::RecordKind;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys look like "myapp:citizens:abc:record"
    /// let kind = RecordKind::new("citizens")?;
    /// let store = RedisCacheStore::with_prefix("redis://localhost", Some("myapp:"), kind).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(
        connection_string: &str,
        prefix: Option<&str>,
        kind: RecordKind,
    ) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(Self::unavailable)?;

        // Startup config: fast-fail, don't hang forever
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(Self::unavailable)?;

        Ok(Self::from_connection(connection, prefix, kind))
    }

    /// Share an existing connection manager between kinds.
    #[must_use]
    pub fn from_connection(connection: ConnectionManager, prefix: Option<&str>, kind: RecordKind) -> Self {
        Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            kind,
        }
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn key_for(&self, id: &str) -> String {
        cache_key(&self.prefix, &self.kind, id)
    }

    fn unavailable(e: impl std::fmt::Display) -> StorageError {
        StorageError::unavailable(TierKind::Cache, e)
    }
}

/// `{prefix}{kind}:{id}:record`
pub(crate) fn cache_key(prefix: &str, kind: &RecordKind, id: &str) -> String {
    format!("{}{}:{}:record", prefix, kind, id)
}

/// Whole seconds for `SET EX`, rounded up so an entry never expires early.
/// Redis rejects `EX 0`, hence the floor of one.
pub(crate) fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_millis().div_ceil(1000).max(1);
    u64::try_from(secs).unwrap_or(u64::MAX)
}

#[async_trait]
impl SecondaryStore for RedisCacheStore {
    fn tier(&self) -> TierKind {
        TierKind::Cache
    }

    async fn try_get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        let conn = self.connection.clone();
        let key = self.key_for(id);

        let data: Option<Vec<u8>> = retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let data: Option<Vec<u8>> = conn.get(&key).await?;
                Ok(data)
            }
        })
        .await
        .map_err(|e: redis::RedisError| Self::unavailable(e))?;

        data.map(|bytes| {
            serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Serialization(format!("Invalid cache entry '{}': {}", key, e)))
        })
        .transpose()
    }

    async fn put(&self, record: &Record, ttl: Option<Duration>) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.key_for(&record.id);
        let data = serde_json::to_vec(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let ttl_secs = ttl.map(ttl_seconds);

        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let data = data.clone();
            async move {
                match ttl_secs {
                    Some(secs) => {
                        let _: () = conn.set_ex(&key, data, secs).await?;
                    }
                    None => {
                        let _: () = conn.set(&key, data).await?;
                    }
                }
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| Self::unavailable(e))?;

        debug!(key = %key, version = record.version, ?ttl_secs, "Cache entry stored");
        Ok(())
    }

    async fn invalidate(&self, id: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.key_for(id);

        retry("redis_delete", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: () = conn.del(&key).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| Self::unavailable(e))
    }
}
