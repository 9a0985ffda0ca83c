// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write path: primary first, then invalidate (never repopulate) the secondaries.

use std::time::Duration;

use tracing::{debug, info};

use super::CompositeRepository;
use crate::record::Record;
use crate::storage::traits::StorageError;

impl CompositeRepository {
    /// Insert a new record. Fails with `AlreadyExists` if the id is taken.
    pub async fn add(&self, record: Record) -> Result<Record, StorageError> {
        self.add_within(record, self.operation_timeout).await
    }

    #[tracing::instrument(skip(self, record), fields(kind = %self.kind, id = %record.id))]
    pub async fn add_within(&self, record: Record, timeout: Duration) -> Result<Record, StorageError> {
        self.deadline("add", timeout, async {
            let stored = self.primary.add(&record).await?;
            self.after_write(&stored).await;
            info!(version = stored.version, "Record added");
            Ok(stored)
        })
        .await
    }

    /// Apply `record` if its version is still current.
    ///
    /// Returns the stored record (version + 1). A stale version yields
    /// `Conflict`; re-read and retry.
    pub async fn update(&self, record: Record) -> Result<Record, StorageError> {
        self.update_within(record, self.operation_timeout).await
    }

    #[tracing::instrument(skip(self, record), fields(kind = %self.kind, id = %record.id, version = record.version))]
    pub async fn update_within(&self, record: Record, timeout: Duration) -> Result<Record, StorageError> {
        self.deadline("update", timeout, async {
            let stored = self.primary.update(&record).await?;
            self.after_write(&stored).await;
            debug!(version = stored.version, "Record updated");
            Ok(stored)
        })
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.delete_within(id, self.operation_timeout).await
    }

    #[tracing::instrument(skip(self), fields(kind = %self.kind))]
    pub async fn delete_within(&self, id: &str, timeout: Duration) -> Result<(), StorageError> {
        self.deadline("delete", timeout, async {
            self.primary.delete(id).await?;
            self.invalidations.record_delete(id);
            let _ = self.invalidate_tiers(id).await;
            info!("Record deleted");
            Ok(())
        })
        .await
    }

    /// Record the commit and invalidate secondaries. Failures are already
    /// logged and queued for repair; they must not fail the write.
    async fn after_write(&self, stored: &Record) {
        self.invalidations.record_write(stored);
        let _ = self.invalidate_tiers(&stored.id).await;
    }
}
