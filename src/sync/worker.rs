// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background backfill of one secondary tier from the primary store.
//!
//! A cycle first repairs the ids the tier is known to have missed: failed
//! invalidations from the write path and records skipped by earlier cycles.
//! It then loads the tier's cursor, scans the primary for everything changed
//! since (minus `cursor_overlap`), and `put`s each record into the tier with a
//! per-record retry budget. A record that exhausts its budget is skipped and
//! queued for the next repair pass, so the rest of the page still lands and
//! the cursor moves past every record that made it.
//!
//! Each record is checked against the [`InvalidationLog`] after its `put`.
//! If the repository wrote the id meanwhile, the worker re-reads the primary
//! and writes (or removes) again, so a tier never keeps a copy older than a
//! write it raced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::types::{CycleOutcome, ReconcileReport, SyncReport, SyncStatus, WorkerState};
use crate::config::WorkerConfig;
use crate::cursor::{CursorStore, SyncCursor};
use crate::record::{now_millis, Record, RecordKind};
use crate::repository::invalidation::{InvalidationLog, InvalidationTicket};
use crate::resilience::retry::{retry_if, RetryConfig};
use crate::storage::traits::{PrimaryScan, PrimaryStore, SecondaryStore, StorageError};
use crate::storage::TierSet;
use crate::tier::TierKind;

/// Page size used by [`SyncWorker::reconcile`].
const RECONCILE_PAGE: usize = 200;

/// Re-reads of a record that keeps changing under one propagation.
const RACE_ATTEMPTS: usize = 3;

/// Clears the in-progress flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct StatusBook {
    last_sync_at: Option<i64>,
    last_successful_sync_at: Option<i64>,
    consecutive_faults: u32,
    last_report: Option<SyncReport>,
}

/// Keeps one secondary tier of one record kind converging on the primary.
///
/// At most one cycle runs at a time; a cycle requested while another is in
/// flight returns [`CycleOutcome::Skipped`] instead of queueing.
pub struct SyncWorker {
    tier: TierKind,
    kind: RecordKind,
    primary: Arc<dyn PrimaryStore>,
    target: Arc<dyn SecondaryStore>,
    cursors: Arc<dyn CursorStore>,
    invalidations: Arc<InvalidationLog>,
    config: RwLock<WorkerConfig>,
    config_updates: Mutex<Option<watch::Receiver<WorkerConfig>>>,
    /// TTL for entries this worker writes (cache tier)
    ttl: Option<std::time::Duration>,
    state: watch::Sender<WorkerState>,
    in_progress: AtomicBool,
    status: Mutex<StatusBook>,
    reports: broadcast::Sender<SyncReport>,
    trigger: Notify,
}

impl SyncWorker {
    /// Worker syncing `tier` of `tiers`.
    ///
    /// Fails if `tier` is the primary or is not wired in `tiers`.
    pub fn new(
        tiers: &TierSet,
        tier: TierKind,
        cursors: Arc<dyn CursorStore>,
        config: WorkerConfig,
    ) -> Result<Self, StorageError> {
        let target = tiers
            .secondary(tier)
            .cloned()
            .ok_or_else(|| StorageError::unavailable(tier, "tier is not configured"))?;
        let (state, _) = watch::channel(WorkerState::Idle);
        let (reports, _) = broadcast::channel(16);

        Ok(Self {
            tier,
            kind: tiers.kind.clone(),
            primary: tiers.primary.clone(),
            target,
            cursors,
            invalidations: tiers.invalidations.clone(),
            config: RwLock::new(config),
            config_updates: Mutex::new(None),
            ttl: None,
            state,
            in_progress: AtomicBool::new(false),
            status: Mutex::new(StatusBook::default()),
            reports,
            trigger: Notify::new(),
        })
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<std::time::Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Pick up config changes in the run loop (interval, retry policy, ...).
    #[must_use]
    pub fn with_config_updates(self, updates: watch::Receiver<WorkerConfig>) -> Self {
        *self.config_updates.lock() = Some(updates);
        self
    }

    #[must_use]
    pub fn tier(&self) -> TierKind {
        self.tier
    }

    #[must_use]
    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    #[must_use]
    pub fn config(&self) -> WorkerConfig {
        self.config.read().clone()
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Every finished cycle's report, as it happens.
    #[must_use]
    pub fn subscribe_reports(&self) -> broadcast::Receiver<SyncReport> {
        self.reports.subscribe()
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        let book = self.status.lock();
        SyncStatus {
            tier: self.tier,
            kind: self.kind.to_string(),
            state: self.state(),
            is_syncing: self.is_syncing(),
            last_sync_at: book.last_sync_at,
            last_successful_sync_at: book.last_successful_sync_at,
            consecutive_faults: book.consecutive_faults,
            last_report: book.last_report.clone(),
        }
    }

    /// Ask the run loop for a cycle now. Triggers coalesce: several calls
    /// before the loop wakes produce one cycle.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
        crate::metrics::set_worker_state(self.tier.as_str(), state.as_gauge());
    }

    /// Run one sync cycle now.
    #[tracing::instrument(skip(self), fields(tier = %self.tier, kind = %self.kind))]
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            debug!("Sync cycle already in progress, skipping");
            crate::metrics::record_sync_cycle(self.tier.as_str(), "skipped", std::time::Duration::ZERO);
            return CycleOutcome::Skipped;
        }
        let _guard = CycleGuard(&self.in_progress);

        let started = Instant::now();
        let config = self.config.read().clone();
        self.set_state(WorkerState::Scanning);

        let stored = match self.cursors.load(self.tier, &self.kind).await {
            Ok(cursor) => cursor,
            Err(e) => return self.fault(format!("cursor load failed: {}", e), None, started),
        };

        let mut report = SyncReport::new(self.tier, self.kind.as_str(), stored.clone());
        let retry_config = config.retry_config();

        self.repair_pending(&retry_config, &mut report).await;

        let mut scan = PrimaryScan::new(&*self.primary, stored.rewound_by(config.cursor_overlap()), config.batch_size);
        // Furthest record propagated so far
        let mut reached = stored.clone();

        loop {
            self.set_state(WorkerState::Scanning);
            // Taken before the page is read so a write racing our put is seen
            let ticket = self.invalidations.ticket();
            let page = match scan.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => return self.fault(format!("primary scan failed: {}", e), Some(report), started),
            };

            self.set_state(WorkerState::Propagating);
            for record in &page {
                report.scanned += 1;
                match self.converge(&record.id, Some(record.clone()), &retry_config, ticket).await {
                    Ok(()) => {
                        report.propagated += 1;
                        reached = reached.max(SyncCursor::at(record));
                    }
                    Err(e) => {
                        warn!(id = %record.id, error = %e, "Record skipped, queued for repair");
                        report.note_error(&record.id, &e);
                        self.invalidations.mark_unrepaired(self.tier, &record.id);
                    }
                }
            }

            if reached > report.cursor {
                match self.cursors.advance(self.tier, &self.kind, &reached).await {
                    Ok(persisted) => report.cursor = persisted,
                    Err(e) => return self.fault(format!("cursor advance failed: {}", e), Some(report), started),
                }
            }
        }

        if report.is_total_failure() {
            let reason = format!("all {} scanned records failed", report.scanned);
            return self.fault(reason, Some(report), started);
        }

        report.duration = started.elapsed();
        crate::metrics::record_propagated(self.tier.as_str(), report.propagated);
        crate::metrics::record_skipped(self.tier.as_str(), report.skipped);
        crate::metrics::record_sync_cycle(self.tier.as_str(), "completed", report.duration);
        if !report.cursor.is_origin() {
            let lag_ms = (now_millis() - report.cursor.updated_at).max(0) as u64;
            crate::metrics::set_cursor_lag(self.tier.as_str(), std::time::Duration::from_millis(lag_ms));
        }

        if report.scanned > 0 || report.repaired > 0 {
            info!(
                scanned = report.scanned,
                propagated = report.propagated,
                skipped = report.skipped,
                repaired = report.repaired,
                duration_ms = report.duration.as_millis() as u64,
                "Sync cycle completed"
            );
        } else {
            debug!("Sync cycle found nothing to propagate");
        }

        {
            let now = now_millis();
            let mut book = self.status.lock();
            book.last_sync_at = Some(now);
            book.last_successful_sync_at = Some(now);
            book.consecutive_faults = 0;
            book.last_report = Some(report.clone());
        }
        let _ = self.reports.send(report.clone());
        self.set_state(WorkerState::Idle);
        CycleOutcome::Completed(report)
    }

    /// Bring the tier's copy of `id` in line with `current`, the primary's
    /// view as of `ticket` (`None` means the record is gone).
    ///
    /// Transient tier errors are retried within the budget. When the id was
    /// written after `ticket`, the primary is read again and the copy
    /// rewritten, up to [`RACE_ATTEMPTS`] times; after that the copy is
    /// dropped and the record reported as failed.
    async fn converge(
        &self,
        id: &str,
        mut current: Option<Record>,
        retry_config: &RetryConfig,
        mut ticket: InvalidationTicket,
    ) -> Result<(), StorageError> {
        let ttl = self.ttl;
        for _ in 0..RACE_ATTEMPTS {
            match &current {
                Some(record) => {
                    retry_if(
                        "sync_put",
                        retry_config,
                        || self.target.put(record, ttl),
                        StorageError::is_transient,
                    )
                    .await?
                }
                None => {
                    retry_if(
                        "sync_remove",
                        retry_config,
                        || self.target.invalidate(id),
                        StorageError::is_transient,
                    )
                    .await?
                }
            }

            if !self.invalidations.invalidated_since(id, ticket) {
                return Ok(());
            }
            debug!(id = %id, "Propagation raced a write, re-reading the primary");
            ticket = self.invalidations.ticket();
            current = self.primary.get(id).await?;
        }

        if let Err(e) = self.target.invalidate(id).await {
            warn!(id = %id, error = %e, "Failed to remove raced copy");
        }
        Err(StorageError::Backend(format!("'{}' kept changing during propagation", id)))
    }

    /// Retry every id queued as unrepaired for this tier. Failures go back
    /// on the queue for the next cycle.
    async fn repair_pending(&self, retry_config: &RetryConfig, report: &mut SyncReport) {
        let pending = self.invalidations.take_unrepaired(self.tier);
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "Repairing queued ids");

        self.set_state(WorkerState::Propagating);
        for id in pending {
            let ticket = self.invalidations.ticket();
            let result = match self.primary.get(&id).await {
                Ok(current) => self.converge(&id, current, retry_config, ticket).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report.repaired += 1,
                Err(e) => {
                    debug!(id = %id, error = %e, "Repair failed, keeping it queued");
                    self.invalidations.mark_unrepaired(self.tier, &id);
                    report.unrepaired += 1;
                }
            }
        }
    }

    fn fault(&self, reason: String, report: Option<SyncReport>, started: Instant) -> CycleOutcome {
        let report = report.map(|mut r| {
            r.duration = started.elapsed();
            r
        });
        error!(tier = %self.tier, kind = %self.kind, reason = %reason, "Sync worker faulted");
        crate::metrics::record_sync_cycle(self.tier.as_str(), "faulted", started.elapsed());

        {
            let mut book = self.status.lock();
            book.last_sync_at = Some(now_millis());
            book.consecutive_faults += 1;
            if let Some(r) = &report {
                book.last_report = Some(r.clone());
            }
        }
        if let Some(r) = &report {
            let _ = self.reports.send(r.clone());
        }
        self.set_state(WorkerState::Faulted);
        CycleOutcome::Faulted { reason, report }
    }

    /// Tick every `interval` until `shutdown` turns true (or its sender drops).
    ///
    /// A faulted cycle is followed by `fault_backoff` in `Faulted`, after
    /// which the worker returns to `Idle` and resumes its schedule.
    #[tracing::instrument(skip(self, shutdown), fields(tier = %self.tier, kind = %self.kind))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut config_rx = self.config_updates.lock().take();
        let mut period = self.config.read().interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = period.as_millis() as u64, "Sync worker running");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }

                Some(changed) = config_changed(&mut config_rx) => {
                    if changed.is_err() {
                        // Sender gone; keep the last config
                        config_rx = None;
                        continue;
                    }
                    if let Some(updated) = config_rx.as_ref().map(|rx| rx.borrow().clone()) {
                        info!(?updated, "Worker config updated");
                        if updated.interval() != period {
                            period = updated.interval();
                            interval = tokio::time::interval(period);
                            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        }
                        *self.config.write() = updated;
                    }
                    continue;
                }

                _ = interval.tick() => {}

                _ = self.trigger.notified() => {
                    debug!("Sync cycle triggered");
                }
            }

            if self.run_cycle().await.is_faulted() {
                let backoff = self.config.read().fault_backoff();
                warn!(backoff_ms = backoff.as_millis() as u64, "Backing off before recovering");
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
                self.set_state(WorkerState::Idle);
                info!("Sync worker recovered from fault");
            }
        }

        self.set_state(WorkerState::Stopped);
        info!("Sync worker stopped");
    }

    /// Compare up to `limit` primary records (in id order) with the tier and
    /// rewrite the copies that are missing, older, or carry a different payload
    /// at the same version.
    ///
    /// Repairs what cursor-based cycles cannot see, e.g. entries lost to a
    /// Redis restart. Does not touch the cursor.
    #[tracing::instrument(skip(self), fields(tier = %self.tier, kind = %self.kind))]
    pub async fn reconcile(&self, limit: usize) -> Result<ReconcileReport, StorageError> {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            return Ok(ReconcileReport { busy: true, ..Default::default() });
        }
        let _guard = CycleGuard(&self.in_progress);

        let retry_config = self.config.read().retry_config();
        let mut report = ReconcileReport::default();
        let mut offset = 0u64;

        while report.checked < limit {
            let page_size = RECONCILE_PAGE.min(limit - report.checked);
            let ticket = self.invalidations.ticket();
            let page = self.primary.list(offset, page_size).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;

            for record in &page {
                report.checked += 1;
                let stale = match self.target.try_get(&record.id).await {
                    Ok(None) => {
                        report.missing += 1;
                        true
                    }
                    Ok(Some(copy)) if copy.version < record.version
                        || (copy.version == record.version && copy.payload_hash() != record.payload_hash()) =>
                    {
                        report.drifted += 1;
                        true
                    }
                    Ok(Some(_)) => false,
                    Err(e) => {
                        debug!(id = %record.id, error = %e, "Tier read failed, rewriting");
                        report.missing += 1;
                        true
                    }
                };
                if !stale {
                    continue;
                }
                match self.converge(&record.id, Some(record.clone()), &retry_config, ticket).await {
                    Ok(()) => report.repaired += 1,
                    Err(e) => {
                        warn!(id = %record.id, error = %e, "Reconcile could not repair record");
                        report.failed += 1;
                    }
                }
            }

            if page.len() < page_size {
                break;
            }
        }

        crate::metrics::record_reconciled(self.tier.as_str(), report.repaired);
        info!(
            checked = report.checked,
            missing = report.missing,
            drifted = report.drifted,
            repaired = report.repaired,
            failed = report.failed,
            "Reconcile pass finished"
        );
        Ok(report)
    }
}

async fn config_changed(
    rx: &mut Option<watch::Receiver<WorkerConfig>>,
) -> Option<Result<(), watch::error::RecvError>> {
    match rx {
        Some(rx) => Some(rx.changed().await),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::MemoryCursorStore;
    use crate::storage::memory::{MemoryPrimaryStore, MemorySecondaryStore};
    use serde_json::json;
    use std::time::Duration;

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            interval_ms: 20,
            retry_budget: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            batch_size: 2,
            cursor_overlap_ms: 0,
            fault_backoff_ms: 20,
            ..Default::default()
        }
    }

    struct Fixture {
        primary: Arc<MemoryPrimaryStore>,
        cache: Arc<MemorySecondaryStore>,
        cursors: Arc<MemoryCursorStore>,
        worker: Arc<SyncWorker>,
    }

    fn fixture() -> Fixture {
        let primary = Arc::new(MemoryPrimaryStore::new());
        let cache = Arc::new(MemorySecondaryStore::cache());
        let cursors = Arc::new(MemoryCursorStore::new());
        let tiers = TierSet::new(RecordKind::new("citizens").unwrap(), primary.clone()).with_cache(cache.clone());
        let worker = SyncWorker::new(&tiers, TierKind::Cache, cursors.clone(), fast_config()).unwrap();
        Fixture { primary, cache, cursors, worker: Arc::new(worker) }
    }

    #[test]
    fn test_unwired_tier_is_rejected() {
        let tiers = TierSet::new(RecordKind::new("citizens").unwrap(), Arc::new(MemoryPrimaryStore::new()));
        let cursors = Arc::new(MemoryCursorStore::new());
        assert!(SyncWorker::new(&tiers, TierKind::Document, cursors.clone(), fast_config()).is_err());
        assert!(SyncWorker::new(&tiers, TierKind::Primary, cursors, fast_config()).is_err());
    }

    #[tokio::test]
    async fn test_cycle_propagates_and_advances_cursor() {
        let f = fixture();
        for i in 0..5 {
            f.primary.add(&Record::new(format!("r-{}", i), json!(i))).await.unwrap();
        }

        let outcome = f.worker.run_cycle().await;
        let report = outcome.report().unwrap().clone();

        assert_eq!(report.propagated, 5);
        assert_eq!(report.skipped, 0);
        assert_eq!(f.cache.len(), 5);
        assert_eq!(f.worker.state(), WorkerState::Idle);

        let persisted = f.cursors.load(TierKind::Cache, f.worker.kind()).await.unwrap();
        assert_eq!(persisted, report.cursor);
        assert!(!persisted.is_origin());

        // Nothing new: the next cycle scans nothing
        let again = f.worker.run_cycle().await;
        assert_eq!(again.report().unwrap().scanned, 0);
    }

    #[tokio::test]
    async fn test_converge_rereads_after_a_racing_write() {
        let f = fixture();
        let v1 = f.primary.add(&Record::new("abc", json!("x"))).await.unwrap();
        let ticket = f.worker.invalidations.ticket();
        let v2 = f.primary.update(&v1.with_payload(json!("y"))).await.unwrap();
        f.worker.invalidations.record_write(&v2);

        f.worker
            .converge("abc", Some(v1), &fast_config().retry_config(), ticket)
            .await
            .unwrap();

        assert_eq!(f.cache.peek("abc"), Some(v2));
    }

    #[tokio::test]
    async fn test_converge_removes_a_record_deleted_meanwhile() {
        let f = fixture();
        let v1 = f.primary.add(&Record::new("abc", json!("x"))).await.unwrap();
        let ticket = f.worker.invalidations.ticket();
        f.primary.delete("abc").await.unwrap();
        f.worker.invalidations.record_delete("abc");

        f.worker
            .converge("abc", Some(v1), &fast_config().retry_config(), ticket)
            .await
            .unwrap();

        assert!(f.cache.peek("abc").is_none());
    }

    #[tokio::test]
    async fn test_queued_ids_are_repaired_before_the_scan() {
        let f = fixture();
        for i in 0..3 {
            f.primary.add(&Record::new(format!("r-{}", i), json!(i))).await.unwrap();
        }
        // Queued as if an earlier cycle had skipped it
        f.worker.invalidations.mark_unrepaired(TierKind::Cache, "r-0");

        let report = f.worker.run_cycle().await.report().unwrap().clone();

        assert_eq!(report.repaired, 1);
        assert_eq!(report.propagated, 3);
        assert_eq!(f.worker.invalidations.unrepaired_len(TierKind::Cache), 0);
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_skipped() {
        let f = fixture();
        f.worker.in_progress.store(true, Ordering::Release);

        assert!(f.worker.run_cycle().await.is_skipped());
        assert!(f.worker.reconcile(10).await.unwrap().busy);

        f.worker.in_progress.store(false, Ordering::Release);
        assert!(!f.worker.run_cycle().await.is_skipped());
    }

    #[tokio::test]
    async fn test_status_and_reports() {
        let f = fixture();
        let mut reports = f.worker.subscribe_reports();
        f.primary.add(&Record::new("a", json!(1))).await.unwrap();

        f.worker.run_cycle().await;

        let report = reports.recv().await.unwrap();
        assert_eq!(report.propagated, 1);
        let status = f.worker.status();
        assert!(status.last_successful_sync_at.is_some());
        assert_eq!(status.consecutive_faults, 0);
        assert_eq!(status.last_report, Some(report));
        assert!(!status.is_syncing);
    }

    #[tokio::test]
    async fn test_reconcile_repairs_missing_and_drifted() {
        let f = fixture();
        let a = f.primary.add(&Record::new("a", json!("fresh"))).await.unwrap();
        let b = f.primary.add(&Record::new("b", json!("fresh"))).await.unwrap();
        f.primary.add(&Record::new("c", json!("fresh"))).await.unwrap();

        f.cache.put(&a, None).await.unwrap();
        f.cache.put(&b.with_payload(json!("tampered")), None).await.unwrap();

        let report = f.worker.reconcile(100).await.unwrap();

        assert_eq!(report.checked, 3);
        assert_eq!(report.missing, 1);
        assert_eq!(report.drifted, 1);
        assert_eq!(report.repaired, 2);
        assert_eq!(f.cache.peek("b").unwrap().payload, json!("fresh"));
        assert!(f.cache.peek("c").is_some());
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let f = fixture();
        f.primary.add(&Record::new("a", json!(1))).await.unwrap();
        let (tx, rx) = watch::channel(false);

        let worker = f.worker.clone();
        let handle = tokio::spawn(async move { worker.run(rx).await });

        // First tick fires immediately
        tokio::time::timeout(Duration::from_secs(2), async {
            while f.cache.peek("a").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(f.worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_config_updates_are_applied() {
        let f = fixture();
        let (config_tx, config_rx) = watch::channel(fast_config());
        let primary = f.primary.clone();
        let tiers = TierSet::new(RecordKind::new("citizens").unwrap(), primary).with_cache(f.cache.clone());
        let worker = Arc::new(
            SyncWorker::new(&tiers, TierKind::Cache, f.cursors.clone(), fast_config())
                .unwrap()
                .with_config_updates(config_rx),
        );
        let (tx, rx) = watch::channel(false);
        let runner = worker.clone();
        let handle = tokio::spawn(async move { runner.run(rx).await });

        config_tx.send(WorkerConfig { batch_size: 7, ..fast_config() }).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while worker.config().batch_size != 7 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
