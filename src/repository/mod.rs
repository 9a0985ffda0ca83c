// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Composite repository.
//!
//! The [`CompositeRepository`] is the single facade request handlers talk to.
//! It hides the tier topology behind the primary store's CRUD contract:
//!
//! ```text
//!            get                               add / update / delete
//!             │                                        │
//!             ▼                                        ▼
//!   ┌──── Cache ────┐ hit                    ┌──── Primary ────┐
//!   │  try_get      │────► return            │ (authoritative) │──► error: return unchanged
//!   └───────┬───────┘                        └────────┬────────┘
//!       miss│                                         │ ok
//!   ┌──── Document ─┐ hit                    invalidate Cache + Document
//!   │  try_get      │────► populate Cache             │ (errors logged)
//!   └───────┬───────┘      return                     ▼
//!       miss│                                       return
//!   ┌──── Primary ──┐ hit
//!   │  get          │────► populate Cache + Document, return
//!   └───────┬───────┘
//!     absent│
//!           ▼
//!       NotFound
//! ```
//!
//! Population is fire-and-forget: spawned tasks bounded by
//! `populate_timeout` whose failures are logged and counted, never returned.
//! Every operation runs under a deadline (`*_within` variants take it
//! explicitly, the plain variants use `operation_timeout`).

mod read;
mod write;
pub mod invalidation;
pub mod typed;

pub use invalidation::{Committed, Invalidate, InvalidationLog, InvalidationTicket};
pub use typed::TypedRepository;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::config::TierSyncConfig;
use crate::record::{Record, RecordKind};
use crate::resilience::circuit_breaker::TierCircuits;
use crate::storage::traits::{PrimaryStore, SecondaryStore, StorageError};
use crate::storage::TierSet;
use crate::tier::TierKind;

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POPULATE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Read-through, write-invalidate facade over one record kind.
///
/// Cheap to clone; clones share stores, breakers and the invalidation log.
#[derive(Clone)]
pub struct CompositeRepository {
    kind: RecordKind,
    primary: Arc<dyn PrimaryStore>,
    cache: Option<Arc<dyn SecondaryStore>>,
    document: Option<Arc<dyn SecondaryStore>>,
    circuits: Arc<TierCircuits>,
    invalidations: Arc<InvalidationLog>,
    cache_ttl: Option<Duration>,
    operation_timeout: Duration,
    populate_timeout: Duration,
}

impl CompositeRepository {
    /// Repository over `tiers` with default timeouts and breakers.
    pub fn new(tiers: &TierSet) -> Self {
        Self {
            kind: tiers.kind.clone(),
            primary: tiers.primary.clone(),
            cache: tiers.cache.clone(),
            document: tiers.document.clone(),
            circuits: Arc::new(TierCircuits::new()),
            invalidations: tiers.invalidations.clone(),
            cache_ttl: Some(DEFAULT_CACHE_TTL),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            populate_timeout: DEFAULT_POPULATE_TIMEOUT,
        }
    }

    /// Repository over `tiers` with TTL and deadlines taken from `config`.
    pub fn from_config(tiers: &TierSet, config: &TierSyncConfig) -> Self {
        Self::new(tiers)
            .with_cache_ttl(config.cache_ttl())
            .with_operation_timeout(config.operation_timeout())
            .with_populate_timeout(config.populate_timeout())
    }

    #[must_use]
    pub fn with_circuits(mut self, circuits: Arc<TierCircuits>) -> Self {
        self.circuits = circuits;
        self
    }

    /// TTL applied to cache entries written on population (`None` = no expiry).
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_populate_timeout(mut self, timeout: Duration) -> Self {
        self.populate_timeout = timeout;
        self
    }

    #[must_use]
    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    #[must_use]
    pub fn circuits(&self) -> &TierCircuits {
        &self.circuits
    }

    #[must_use]
    pub fn invalidation_log(&self) -> &Arc<InvalidationLog> {
        &self.invalidations
    }

    /// Secondary tiers in read order.
    fn secondaries(&self) -> impl Iterator<Item = &Arc<dyn SecondaryStore>> {
        self.cache.iter().chain(self.document.iter())
    }

    fn ttl_for(&self, tier: TierKind) -> Option<Duration> {
        match tier {
            TierKind::Cache => self.cache_ttl,
            _ => None,
        }
    }

    /// Run `fut` under `timeout`; expiry drops the chain and yields `Timeout`.
    async fn deadline<T>(
        &self,
        operation: &'static str,
        timeout: Duration,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        let _timer = crate::metrics::LatencyTimer::new("composite", operation);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => {
                let status = match &result {
                    Ok(_) => "success",
                    Err(StorageError::NotFound) => "not_found",
                    Err(StorageError::Conflict { .. }) => "conflict",
                    Err(_) => "error",
                };
                crate::metrics::record_operation("composite", operation, status);
                result
            }
            Err(_) => {
                warn!(kind = %self.kind, operation, ?timeout, "Repository operation timed out");
                crate::metrics::record_timeout(operation);
                crate::metrics::record_operation("composite", operation, "timeout");
                Err(StorageError::Timeout {
                    operation: operation.to_string(),
                })
            }
        }
    }

    /// Best-effort invalidation of every secondary tier for `id`.
    ///
    /// The caller records the invalidation in the log first. Runs detached so
    /// a caller's deadline cannot cut it short once the primary write has
    /// committed. A tier that fails is marked unrepaired for its sync worker.
    /// Returns the first tier error, which the write path discards.
    async fn invalidate_tiers(&self, id: &str) -> Result<(), StorageError> {
        let stores: Vec<Arc<dyn SecondaryStore>> = self.secondaries().cloned().collect();
        if stores.is_empty() {
            return Ok(());
        }
        let id = id.to_string();
        let kind = self.kind.clone();
        let invalidations = self.invalidations.clone();

        let task = tokio::spawn(async move {
            let results = join_all(stores.iter().map(|store| store.invalidate(&id))).await;
            let mut first_error = None;
            for (store, result) in stores.iter().zip(results) {
                let tier = store.tier();
                match result {
                    Ok(()) => {
                        debug!(kind = %kind, id = %id, tier = %tier, "Invalidated");
                        crate::metrics::record_invalidation(tier.as_str(), true);
                    }
                    Err(e) => {
                        warn!(kind = %kind, id = %id, tier = %tier, error = %e, "Invalidation failed");
                        crate::metrics::record_invalidation(tier.as_str(), false);
                        invalidations.mark_unrepaired(tier, &id);
                        first_error.get_or_insert(e);
                    }
                }
            }
            first_error
        });

        match task.await {
            Ok(None) => Ok(()),
            Ok(Some(e)) => Err(e),
            Err(e) => Err(StorageError::Backend(format!("Invalidation task failed: {}", e))),
        }
    }
}

#[async_trait]
impl Invalidate for CompositeRepository {
    /// Administrative invalidation. Unlike the write path, tier failures are
    /// reported so an operator knows the flush did not land everywhere.
    async fn invalidate(&self, id: &str) -> Result<(), StorageError> {
        self.invalidations.record(id);
        self.invalidate_tiers(id).await
    }
}

/// Outcome of reading one secondary tier.
enum TierRead {
    Hit(Record),
    Miss,
}
