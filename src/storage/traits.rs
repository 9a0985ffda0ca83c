// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cursor::SyncCursor;
use crate::record::Record;
use crate::tier::TierKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Record not found")]
    NotFound,
    #[error("Version conflict for '{id}': expected {expected}, stored {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("Record '{id}' already exists")]
    AlreadyExists { id: String },
    #[error("{tier} tier unavailable: {message}")]
    TierUnavailable { tier: TierKind, message: String },
    #[error("Operation '{operation}' exceeded its deadline")]
    Timeout { operation: String },
    #[error("Invalid record kind '{0}'")]
    InvalidKind(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{id}': expected hash {expected}, got {actual}")]
    Corruption {
        id: String,
        expected: String,
        actual: String,
    },
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    ///
    /// Conflicts, missing records and bad input never heal on their own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TierUnavailable { .. } | Self::Backend(_) | Self::Timeout { .. }
        )
    }

    pub(crate) fn unavailable(tier: TierKind, err: impl std::fmt::Display) -> Self {
        Self::TierUnavailable {
            tier,
            message: err.to_string(),
        }
    }
}

/// Durable source of truth for one record kind.
///
/// The only adapter allowed to treat "record absent" as authoritative.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Record>, StorageError>;

    /// Insert a new record. Fails with [`StorageError::AlreadyExists`] if the id is taken.
    async fn add(&self, record: &Record) -> Result<Record, StorageError>;

    /// Apply `record` if its version matches the stored one.
    ///
    /// Returns the stored record with the version incremented by one, or
    /// [`StorageError::Conflict`] on mismatch.
    async fn update(&self, record: &Record) -> Result<Record, StorageError>;

    async fn delete(&self, id: &str) -> Result<(), StorageError>;

    /// Records strictly after `cursor` in `(updated_at, id)` order, at most `limit`.
    async fn scan_since(&self, cursor: &SyncCursor, limit: usize) -> Result<Vec<Record>, StorageError>;

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.get(id).await?.is_some())
    }

    /// Page of records ordered by id.
    async fn list(&self, offset: u64, limit: usize) -> Result<Vec<Record>, StorageError>;

    async fn count_all(&self) -> Result<u64, StorageError>;
}

/// A derived, disposable copy of primary data (cache or document tier).
///
/// Writes are last-write-wins; the primary store arbitrates versions.
#[async_trait]
pub trait SecondaryStore: Send + Sync {
    fn tier(&self) -> TierKind;

    /// `None` means Miss; callers fall through to the next tier.
    async fn try_get(&self, id: &str) -> Result<Option<Record>, StorageError>;

    async fn put(&self, record: &Record, ttl: Option<Duration>) -> Result<(), StorageError>;

    /// Remove the entry. Invalidating an absent key is not an error.
    async fn invalidate(&self, id: &str) -> Result<(), StorageError>;
}

/// Lazy, restartable page-by-page scan over a primary store.
///
/// Positions advance within the scan only; persisting them is the caller's job.
pub struct PrimaryScan<'a> {
    store: &'a dyn PrimaryStore,
    position: SyncCursor,
    page_size: usize,
    exhausted: bool,
}

impl<'a> PrimaryScan<'a> {
    pub fn new(store: &'a dyn PrimaryStore, from: SyncCursor, page_size: usize) -> Self {
        Self {
            store,
            position: from,
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    /// Fetch the next page, or `None` once the store has nothing past the position.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Record>>, StorageError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self.store.scan_since(&self.position, self.page_size).await?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.position = SyncCursor::at(last);
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }

    #[must_use]
    pub fn position(&self) -> &SyncCursor {
        &self.position
    }
}
