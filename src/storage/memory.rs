// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process storage for every tier.
//!
//! [`MemoryPrimaryStore`] enforces the same optimistic-concurrency contract as
//! the SQL store; [`MemorySecondaryStore`] stands in for the cache or the
//! document tier and honours TTLs.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::traits::{PrimaryStore, SecondaryStore, StorageError};
use crate::cursor::SyncCursor;
use crate::record::{Record, WriteClock};
use crate::tier::TierKind;

pub struct MemoryPrimaryStore {
    data: DashMap<String, Record>,
    clock: WriteClock,
}

impl MemoryPrimaryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            clock: WriteClock::default(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for MemoryPrimaryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        Ok(self.data.get(id).map(|r| r.value().clone()))
    }

    async fn add(&self, record: &Record) -> Result<Record, StorageError> {
        match self.data.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists { id: record.id.clone() }),
            Entry::Vacant(slot) => {
                let stored = Record::reconstruct(
                    record.id.clone(),
                    record.version.max(1),
                    self.clock.stamp(),
                    record.payload.clone(),
                );
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn update(&self, record: &Record) -> Result<Record, StorageError> {
        // The shard write lock makes check-and-set atomic per id.
        let mut current = self.data.get_mut(&record.id).ok_or(StorageError::NotFound)?;
        if current.version != record.version {
            return Err(StorageError::Conflict {
                id: record.id.clone(),
                expected: record.version,
                actual: current.version,
            });
        }
        let stored = Record::reconstruct(
            record.id.clone(),
            current.version + 1,
            self.clock.stamp(),
            record.payload.clone(),
        );
        *current = stored.clone();
        Ok(stored)
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.data.remove(id).map(|_| ()).ok_or(StorageError::NotFound)
    }

    async fn scan_since(&self, cursor: &SyncCursor, limit: usize) -> Result<Vec<Record>, StorageError> {
        let mut page: Vec<Record> = self
            .data
            .iter()
            .filter(|r| cursor.precedes(r.value()))
            .map(|r| r.value().clone())
            .collect();
        page.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));
        page.truncate(limit);
        Ok(page)
    }

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.data.contains_key(id))
    }

    async fn list(&self, offset: u64, limit: usize) -> Result<Vec<Record>, StorageError> {
        let mut all: Vec<Record> = self.data.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all.into_iter().skip(offset as usize).take(limit).collect())
    }

    async fn count_all(&self) -> Result<u64, StorageError> {
        Ok(self.data.len() as u64)
    }
}

/// In-process cache or document tier.
pub struct MemorySecondaryStore {
    tier: TierKind,
    data: DashMap<String, (Record, Option<Instant>)>,
}

impl MemorySecondaryStore {
    #[must_use]
    pub fn cache() -> Self {
        Self::for_tier(TierKind::Cache)
    }

    #[must_use]
    pub fn document() -> Self {
        Self::for_tier(TierKind::Document)
    }

    #[must_use]
    pub fn for_tier(tier: TierKind) -> Self {
        Self {
            tier,
            data: DashMap::new(),
        }
    }

    /// Current entry count (expired entries included until touched)
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    /// Direct peek for assertions, ignoring TTL bookkeeping.
    #[must_use]
    pub fn peek(&self, id: &str) -> Option<Record> {
        self.data.get(id).map(|e| e.value().0.clone())
    }
}

#[async_trait]
impl SecondaryStore for MemorySecondaryStore {
    fn tier(&self) -> TierKind {
        self.tier
    }

    async fn try_get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        let now = Instant::now();
        let is_expired = |expires_at: &Option<Instant>| expires_at.is_some_and(|deadline| deadline <= now);

        if let Some(entry) = self.data.get(id) {
            let (record, expires_at) = entry.value();
            if !is_expired(expires_at) {
                return Ok(Some(record.clone()));
            }
        }
        // Re-checked under the shard lock so a fresh put is not removed
        self.data.remove_if(id, |_, (_, expires_at)| is_expired(expires_at));
        Ok(None)
    }

    async fn put(&self, record: &Record, ttl: Option<Duration>) -> Result<(), StorageError> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.data.insert(record.id.clone(), (record.clone(), expires_at));
        Ok(())
    }

    async fn invalidate(&self, id: &str) -> Result<(), StorageError> {
        self.data.remove(id);
        Ok(())
    }
}
