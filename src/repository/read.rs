// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read path: cache → document → primary, populating faster tiers on the way back.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{CompositeRepository, InvalidationTicket, TierRead};
use crate::record::Record;
use crate::storage::traits::{SecondaryStore, StorageError};
use crate::tier::TierKind;

impl CompositeRepository {
    /// Get a record by id.
    ///
    /// Falls through cache, document and primary. Secondary failures read as
    /// misses; only the primary's verdict (including `NotFound`) is returned.
    pub async fn get(&self, id: &str) -> Result<Record, StorageError> {
        self.get_within(id, self.operation_timeout).await
    }

    #[tracing::instrument(skip(self), fields(kind = %self.kind, tier))]
    pub async fn get_within(&self, id: &str, timeout: Duration) -> Result<Record, StorageError> {
        self.deadline("get", timeout, self.read_chain(id)).await
    }

    /// Whether the record exists, answered by the fastest tier that knows.
    pub async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        self.exists_within(id, self.operation_timeout).await
    }

    pub async fn exists_within(&self, id: &str, timeout: Duration) -> Result<bool, StorageError> {
        self.deadline("exists", timeout, async {
            for store in self.secondaries() {
                if let TierRead::Hit(_) = self.read_secondary(store, id).await {
                    return Ok(true);
                }
            }
            self.primary.exists(id).await
        })
        .await
    }

    /// Page of records ordered by id, straight from the primary store.
    ///
    /// Secondary tiers hold arbitrary subsets and cannot answer listings.
    pub async fn browse(&self, offset: u64, limit: usize) -> Result<Vec<Record>, StorageError> {
        self.deadline("browse", self.operation_timeout, self.primary.list(offset, limit))
            .await
    }

    /// Total number of records in the primary store.
    pub async fn count(&self) -> Result<u64, StorageError> {
        self.deadline("count", self.operation_timeout, self.primary.count_all())
            .await
    }

    async fn read_chain(&self, id: &str) -> Result<Record, StorageError> {
        // Taken before any tier is read so a racing write is always observed
        let ticket = self.invalidations.ticket();

        if let Some(cache) = &self.cache {
            if let TierRead::Hit(record) = self.read_secondary(cache, id).await {
                tracing::Span::current().record("tier", "cache");
                return Ok(record);
            }
        }

        if let Some(document) = &self.document {
            if let TierRead::Hit(record) = self.read_secondary(document, id).await {
                tracing::Span::current().record("tier", "document");
                if let Some(cache) = &self.cache {
                    self.populate(cache.clone(), record.clone(), ticket);
                }
                return Ok(record);
            }
        }

        match self.primary.get(id).await? {
            Some(record) => {
                tracing::Span::current().record("tier", "primary");
                crate::metrics::record_tier_hit(TierKind::Primary.as_str());
                for store in self.secondaries() {
                    self.populate(store.clone(), record.clone(), ticket);
                }
                Ok(record)
            }
            None => {
                tracing::Span::current().record("tier", "miss");
                debug!(id = %id, "Record not found in any tier");
                crate::metrics::record_tier_miss(TierKind::Primary.as_str());
                Err(StorageError::NotFound)
            }
        }
    }

    /// Read one secondary tier through its breaker. Errors degrade to a miss,
    /// and so does a copy older than a write the log has seen.
    async fn read_secondary(&self, store: &Arc<dyn SecondaryStore>, id: &str) -> TierRead {
        let tier = store.tier();
        let result = match self.circuits.for_tier(tier) {
            Some(breaker) => breaker
                .call(|| store.try_get(id))
                .await
                .map_err(|e| e.into_storage(tier)),
            None => store.try_get(id).await,
        };

        match result {
            Ok(Some(record)) if self.invalidations.is_stale(&record) => {
                debug!(id = %id, tier = %tier, version = record.version, "Tier copy predates the last write, ignoring");
                crate::metrics::record_tier_miss(tier.as_str());
                TierRead::Miss
            }
            Ok(Some(record)) => {
                debug!(id = %id, tier = %tier, "Tier hit");
                crate::metrics::record_tier_hit(tier.as_str());
                TierRead::Hit(record)
            }
            Ok(None) => {
                crate::metrics::record_tier_miss(tier.as_str());
                TierRead::Miss
            }
            Err(e) => {
                warn!(id = %id, tier = %tier, error = %e, "Tier read failed, falling through");
                crate::metrics::record_tier_miss(tier.as_str());
                TierRead::Miss
            }
        }
    }

    /// Write `record` into `store` in the background.
    ///
    /// If the id was invalidated after `ticket`, the copy we just wrote may
    /// predate that write, so it is removed again.
    fn populate(&self, store: Arc<dyn SecondaryStore>, record: Record, ticket: InvalidationTicket) {
        let tier = store.tier();
        let ttl = self.ttl_for(tier);
        let timeout = self.populate_timeout;
        let invalidations = self.invalidations.clone();

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, store.put(&record, ttl)).await {
                Ok(Ok(())) => {
                    if invalidations.invalidated_since(&record.id, ticket) {
                        debug!(id = %record.id, tier = %tier, "Populated copy went stale, removing");
                        match tokio::time::timeout(timeout, store.invalidate(&record.id)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!(id = %record.id, tier = %tier, error = %e, "Failed to remove stale copy");
                                invalidations.mark_unrepaired(tier, &record.id);
                            }
                            Err(_) => {
                                warn!(id = %record.id, tier = %tier, "Timed out removing stale copy");
                                invalidations.mark_unrepaired(tier, &record.id);
                            }
                        }
                        crate::metrics::record_populate(tier.as_str(), "stale");
                    } else {
                        debug!(id = %record.id, tier = %tier, version = record.version, "Tier populated");
                        crate::metrics::record_populate(tier.as_str(), "success");
                    }
                }
                Ok(Err(e)) => {
                    warn!(id = %record.id, tier = %tier, error = %e, "Tier population failed");
                    crate::metrics::record_populate(tier.as_str(), "error");
                }
                Err(_) => {
                    warn!(id = %record.id, tier = %tier, ?timeout, "Tier population timed out");
                    crate::metrics::record_populate(tier.as_str(), "timeout");
                }
            }
        });
    }
}
