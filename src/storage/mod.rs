// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage adapters for the primary, cache and document tiers.
//!
//! - [`traits`]: the [`PrimaryStore`](traits::PrimaryStore) and
//!   [`SecondaryStore`](traits::SecondaryStore) contracts
//! - [`sql`]: relational primary store (SQLite, MySQL, Postgres)
//! - [`document`]: document tier on a SQL collection table
//! - [`redis`]: key-value cache tier
//! - [`memory`]: in-process implementations of every tier
//!
//! [`TierSet`] bundles the stores of one record kind so the repository and
//! the sync workers are wired against the same instances.

pub mod traits;
pub mod memory;
pub mod sql;
pub mod document;
pub mod redis;

use std::sync::Arc;

use tracing::info;

use crate::config::TierSyncConfig;
use crate::record::RecordKind;
use crate::repository::invalidation::InvalidationLog;
use crate::tier::TierKind;
use traits::{PrimaryStore, SecondaryStore, StorageError};

/// The stores backing one record kind.
#[derive(Clone)]
pub struct TierSet {
    pub kind: RecordKind,
    pub primary: Arc<dyn PrimaryStore>,
    pub cache: Option<Arc<dyn SecondaryStore>>,
    pub document: Option<Arc<dyn SecondaryStore>>,
    /// Shared by the repository and the workers of this kind
    pub invalidations: Arc<InvalidationLog>,
}

impl TierSet {
    pub fn new(kind: RecordKind, primary: Arc<dyn PrimaryStore>) -> Self {
        Self {
            kind,
            primary,
            cache: None,
            document: None,
            invalidations: Arc::new(InvalidationLog::default()),
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn SecondaryStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_document(mut self, document: Arc<dyn SecondaryStore>) -> Self {
        self.document = Some(document);
        self
    }

    #[must_use]
    pub fn with_invalidation_log(mut self, log: Arc<InvalidationLog>) -> Self {
        self.invalidations = log;
        self
    }

    #[must_use]
    pub fn secondary(&self, tier: TierKind) -> Option<&Arc<dyn SecondaryStore>> {
        match tier {
            TierKind::Cache => self.cache.as_ref(),
            TierKind::Document => self.document.as_ref(),
            TierKind::Primary => None,
        }
    }

    /// Connect every tier that has a URL in `config`.
    ///
    /// `sql_url` is mandatory; the cache and document tiers are optional.
    pub async fn connect(config: &TierSyncConfig, kind: RecordKind) -> Result<Self, StorageError> {
        let sql_url = config
            .sql_url
            .as_deref()
            .ok_or_else(|| StorageError::Backend("sql_url is not configured".into()))?;

        let primary = sql::SqlPrimaryStore::connect(sql_url, kind.clone()).await?;
        let mut tiers = Self::new(kind.clone(), Arc::new(primary))
            .with_invalidation_log(Arc::new(InvalidationLog::new(config.invalidation_retention())));

        if let Some(url) = config.redis_url.as_deref() {
            let cache = redis::RedisCacheStore::with_prefix(url, config.redis_prefix.as_deref(), kind.clone()).await?;
            tiers = tiers.with_cache(Arc::new(cache));
        }

        if let Some(url) = config.document_url.as_deref() {
            let document = document::SqlDocumentStore::connect(url, &kind).await?;
            tiers = tiers.with_document(Arc::new(document));
        }

        info!(
            kind = %kind,
            cache = tiers.cache.is_some(),
            document = tiers.document.is_some(),
            "Storage tiers connected"
        );
        Ok(tiers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryPrimaryStore, MemorySecondaryStore};

    #[test]
    fn test_secondary_lookup() {
        let tiers = TierSet::new(RecordKind::new("citizens").unwrap(), Arc::new(MemoryPrimaryStore::new()))
            .with_cache(Arc::new(MemorySecondaryStore::cache()));

        assert!(tiers.secondary(TierKind::Cache).is_some());
        assert!(tiers.secondary(TierKind::Document).is_none());
        assert!(tiers.secondary(TierKind::Primary).is_none());
    }

    #[tokio::test]
    async fn test_connect_requires_sql_url() {
        let result = TierSet::connect(&TierSyncConfig::default(), RecordKind::new("citizens").unwrap()).await;
        assert!(matches!(result, Err(StorageError::Backend(_))));
    }
}
