// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache invalidation hooks.
//!
//! [`Invalidate`] is the narrow entry point used by the write path and by
//! administrative flushes. [`InvalidationLog`] remembers recent invalidations
//! together with the version each write committed, which serves three
//! readers:
//!
//! ```text
//! reader: ticket ─► read primary (v1) ─────────────► put v1 ─► invalidated_since? ─► yes: invalidate
//! writer:                 update primary (v2) ─► record v2 ─► invalidate tiers ─► failed? ─► mark unrepaired
//! any hit:  copy older than the recorded commit (or a tombstone) ─► treated as a miss
//! worker:   take_unrepaired(tier) ─► re-read primary ─► put or remove
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::record::Record;
use crate::storage::traits::StorageError;
use crate::tier::TierKind;

/// Prune the log every this many recorded invalidations.
const PRUNE_EVERY: u64 = 1024;

/// Retention used when none is derived from configuration.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60);

/// Explicit invalidation of every secondary copy of a record.
///
/// Idempotent and commutative: invalidating an absent id succeeds, and
/// concurrent callers need no coordination.
#[async_trait]
pub trait Invalidate: Send + Sync {
    async fn invalidate(&self, id: &str) -> Result<(), StorageError>;

    async fn invalidate_many(&self, ids: &[String]) -> Result<(), StorageError> {
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.invalidate(id).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Position in the invalidation sequence, taken before a read chain starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct InvalidationTicket(u64);

/// What the write path last committed for an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Committed {
    /// Invalidated without a known version (administrative flush)
    Unknown,
    Version { version: u64, updated_at: i64 },
    Deleted,
}

impl Committed {
    /// Whether a tier copy is older than this commit.
    #[must_use]
    pub fn supersedes(&self, copy: &Record) -> bool {
        match *self {
            Self::Unknown => false,
            Self::Version { version, updated_at } => copy.version < version || copy.updated_at < updated_at,
            Self::Deleted => true,
        }
    }

    fn merge(self, newer: Option<Committed>) -> Committed {
        match (self, newer) {
            (current, None) => current,
            // Two updates can record out of order; keep the later commit
            (
                Self::Version { version: a, updated_at: at },
                Some(Self::Version { version: b, updated_at: bt }),
            ) if (a, at) > (b, bt) => self,
            (_, Some(newer)) => newer,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    seq: u64,
    at: Instant,
    committed: Committed,
}

/// Per-id record of the latest invalidation and commit.
///
/// Entries live for `retention`, which must exceed the longest a population
/// write or a worker page can take between its ticket and its re-check (see
/// [`crate::TierSyncConfig::invalidation_retention`]). A ticket older than a
/// pruned entry is answered conservatively: `invalidated_since` reports
/// `true`. Ids with an unrepaired tier copy are never pruned.
pub struct InvalidationLog {
    sequence: AtomicU64,
    /// Highest sequence number dropped by pruning
    pruned_through: AtomicU64,
    entries: DashMap<String, Entry>,
    unrepaired: DashSet<(TierKind, String)>,
    retention: Duration,
}

impl Default for InvalidationLog {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl InvalidationLog {
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            pruned_through: AtomicU64::new(0),
            entries: DashMap::new(),
            unrepaired: DashSet::new(),
            retention,
        }
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        self.retention
    }

    #[must_use]
    pub fn ticket(&self) -> InvalidationTicket {
        InvalidationTicket(self.sequence.load(Ordering::Acquire))
    }

    /// Note that `id` is being invalidated now, keeping any known commit.
    pub fn record(&self, id: &str) {
        self.bump(id, None);
    }

    /// Note that `record` was just committed to the primary.
    pub fn record_write(&self, record: &Record) {
        let committed = Committed::Version {
            version: record.version,
            updated_at: record.updated_at,
        };
        self.bump(&record.id, Some(committed));
    }

    /// Note that `id` was just deleted from the primary.
    pub fn record_delete(&self, id: &str) {
        self.bump(id, Some(Committed::Deleted));
    }

    fn bump(&self, id: &str, committed: Option<Committed>) {
        let seq = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let now = Instant::now();
        self.entries
            .entry(id.to_string())
            .and_modify(|entry| {
                entry.seq = seq;
                entry.at = now;
                entry.committed = entry.committed.merge(committed);
            })
            .or_insert(Entry {
                seq,
                at: now,
                committed: committed.unwrap_or(Committed::Unknown),
            });

        if seq % PRUNE_EVERY == 0 {
            self.prune();
        }
    }

    /// Whether `id` was invalidated after `ticket` was taken.
    #[must_use]
    pub fn invalidated_since(&self, id: &str, ticket: InvalidationTicket) -> bool {
        if self.pruned_through.load(Ordering::Acquire) > ticket.0 {
            return true;
        }
        self.entries.get(id).is_some_and(|e| e.value().seq > ticket.0)
    }

    /// Latest commit recorded for `id`, if still retained.
    #[must_use]
    pub fn committed(&self, id: &str) -> Option<Committed> {
        self.entries.get(id).map(|e| e.value().committed)
    }

    /// Whether `copy`, read from a secondary tier, predates a recorded write.
    #[must_use]
    pub fn is_stale(&self, copy: &Record) -> bool {
        self.committed(&copy.id).is_some_and(|c| c.supersedes(copy))
    }

    /// Remember that `tier` may still hold an outdated copy of `id`.
    pub fn mark_unrepaired(&self, tier: TierKind, id: &str) {
        self.unrepaired.insert((tier, id.to_string()));
    }

    /// Drain the ids `tier` still has to repair.
    pub fn take_unrepaired(&self, tier: TierKind) -> Vec<String> {
        let ids: Vec<String> = self
            .unrepaired
            .iter()
            .filter(|key| key.0 == tier)
            .map(|key| key.1.clone())
            .collect();
        for id in &ids {
            self.unrepaired.remove(&(tier, id.clone()));
        }
        ids
    }

    #[must_use]
    pub fn unrepaired_len(&self, tier: TierKind) -> usize {
        self.unrepaired.iter().filter(|key| key.0 == tier).count()
    }

    fn is_pinned(&self, id: &str) -> bool {
        [TierKind::Cache, TierKind::Document]
            .into_iter()
            .any(|tier| self.unrepaired.contains(&(tier, id.to_string())))
    }

    /// Drop entries older than the retention window.
    pub fn prune(&self) {
        let cutoff = self.retention;
        let before = self.entries.len();
        let mut dropped_through = 0;
        self.entries.retain(|id, entry| {
            let keep = entry.at.elapsed() < cutoff || self.is_pinned(id);
            if !keep {
                dropped_through = dropped_through.max(entry.seq);
            }
            keep
        });
        self.pruned_through.fetch_max(dropped_through, Ordering::AcqRel);
        debug!(removed = before.saturating_sub(self.entries.len()), "Pruned invalidation log");
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_detects_later_invalidation() {
        let log = InvalidationLog::default();
        log.record("a");

        let ticket = log.ticket();
        assert!(!log.invalidated_since("a", ticket));
        assert!(!log.invalidated_since("b", ticket));

        log.record("a");
        assert!(log.invalidated_since("a", ticket));
        assert!(!log.invalidated_since("b", ticket));
    }

    #[test]
    fn test_prune_respects_retention() {
        let log = InvalidationLog::new(Duration::ZERO);
        log.record("a");
        log.record("b");
        assert_eq!(log.len(), 2);

        log.prune();
        assert!(log.is_empty());

        let kept = InvalidationLog::new(Duration::from_secs(60));
        kept.record("a");
        kept.prune();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_pruned_entries_answer_conservatively() {
        let log = InvalidationLog::new(Duration::ZERO);
        let ticket = log.ticket();
        log.record("a");
        log.prune();

        // The entry for "a" is gone, but a ticket that predates it cannot
        // rule out a race on any id
        assert!(log.invalidated_since("a", ticket));
        assert!(log.invalidated_since("b", ticket));
        assert!(!log.invalidated_since("b", log.ticket()));
    }

    #[test]
    fn test_unrepaired_ids_survive_pruning() {
        let log = InvalidationLog::new(Duration::ZERO);
        log.record_delete("gone");
        log.record("other");
        log.mark_unrepaired(TierKind::Document, "gone");

        log.prune();

        assert_eq!(log.committed("gone"), Some(Committed::Deleted));
        assert!(log.committed("other").is_none());
        assert_eq!(log.unrepaired_len(TierKind::Document), 1);
        assert_eq!(log.unrepaired_len(TierKind::Cache), 0);

        assert_eq!(log.take_unrepaired(TierKind::Document), vec!["gone".to_string()]);
        assert!(log.take_unrepaired(TierKind::Document).is_empty());
    }

    #[test]
    fn test_copies_older_than_the_last_commit_are_stale() {
        use serde_json::json;

        let log = InvalidationLog::default();
        let v1 = Record::reconstruct("a".into(), 1, 100, json!("x"));
        let v2 = Record::reconstruct("a".into(), 2, 200, json!("y"));
        assert!(!log.is_stale(&v1));

        log.record_write(&v2);
        assert!(log.is_stale(&v1));
        assert!(!log.is_stale(&v2));

        // A late record of the older commit does not lower the floor
        log.record_write(&v1);
        assert!(log.is_stale(&v1));

        // Administrative flushes keep what is known
        log.record("a");
        assert!(log.is_stale(&v1));

        log.record_delete("a");
        assert!(log.is_stale(&v2));

        // Re-created after the delete: a pre-delete copy is still older
        let again = Record::reconstruct("a".into(), 1, 300, json!("z"));
        log.record_write(&again);
        assert!(!log.is_stale(&again));
        assert!(log.is_stale(&v2));
    }

    struct Counting(std::sync::Mutex<Vec<String>>);

    #[async_trait]
    impl Invalidate for Counting {
        async fn invalidate(&self, id: &str) -> Result<(), StorageError> {
            self.0.lock().unwrap().push(id.to_string());
            if id == "bad" {
                return Err(StorageError::Backend("down".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_invalidate_many_visits_every_id() {
        let hook = Counting(std::sync::Mutex::new(vec![]));
        let ids = vec!["a".to_string(), "bad".to_string(), "c".to_string()];

        let result = hook.invalidate_many(&ids).await;

        assert_eq!(result, Err(StorageError::Backend("down".into())));
        assert_eq!(*hook.0.lock().unwrap(), ids);
    }
}
