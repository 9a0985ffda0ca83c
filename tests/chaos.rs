//! Chaos testing for tier sync.
//!
//! Failure scenarios driven by `FailingSecondary`, a wrapper that injects
//! errors into a secondary tier:
//! 1. **Tier outages** - reads and writes keep working off the primary
//! 2. **Poison records** - one record failing does not stall its neighbours
//! 3. **Total failure** - the worker faults, backs off and recovers
//! 4. **Races** - slow tier writes and lost invalidations never surface a
//!    version older than the last committed write
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;

use tier_sync::storage::memory::{MemoryPrimaryStore, MemorySecondaryStore};
use tier_sync::{
    CircuitConfig, CompositeRepository, CursorStore, CycleOutcome, Invalidate, MemoryCursorStore, PrimaryStore,
    Record, RecordKind, SecondaryStore, StorageError, SyncCursor, SyncWorker, TierCircuits, TierKind, TierSet,
    WorkerConfig, WorkerState,
};

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Secondary tier that fails on demand.
struct FailingSecondary {
    inner: MemorySecondaryStore,
    /// Fail every call while set
    down: AtomicBool,
    /// Fail `put` for these ids only
    poisoned: Mutex<HashSet<String>>,
    /// Fail this many `put` calls before behaving
    flaky_puts: AtomicU64,
    /// Delay applied to every `put` before it lands
    put_delay: Mutex<Duration>,
    /// Delay between a `put` landing and its acknowledgement
    ack_delay: Mutex<Duration>,
    /// Fail this many `invalidate` calls before behaving
    failing_invalidations: AtomicU64,
}

impl FailingSecondary {
    fn new(tier: TierKind) -> Self {
        Self {
            inner: MemorySecondaryStore::for_tier(tier),
            down: AtomicBool::new(false),
            poisoned: Mutex::new(HashSet::new()),
            flaky_puts: AtomicU64::new(0),
            put_delay: Mutex::new(Duration::ZERO),
            ack_delay: Mutex::new(Duration::ZERO),
            failing_invalidations: AtomicU64::new(0),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn poison(&self, id: &str) {
        self.poisoned.lock().insert(id.to_string());
    }

    fn heal(&self) {
        self.set_down(false);
        self.poisoned.lock().clear();
        self.flaky_puts.store(0, Ordering::SeqCst);
        self.failing_invalidations.store(0, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected outage".into()));
        }
        Ok(())
    }

    fn peek(&self, id: &str) -> Option<Record> {
        self.inner.peek(id)
    }
}

#[async_trait]
impl SecondaryStore for FailingSecondary {
    fn tier(&self) -> TierKind {
        self.inner.tier()
    }

    async fn try_get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        self.check()?;
        self.inner.try_get(id).await
    }

    async fn put(&self, record: &Record, ttl: Option<Duration>) -> Result<(), StorageError> {
        let delay = *self.put_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        if self.poisoned.lock().contains(&record.id) {
            return Err(StorageError::Backend(format!("poisoned record {}", record.id)));
        }
        let flaky = self
            .flaky_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if flaky {
            return Err(StorageError::Backend("injected flake".into()));
        }
        self.inner.put(record, ttl).await?;

        let ack = *self.ack_delay.lock();
        if !ack.is_zero() {
            tokio::time::sleep(ack).await;
        }
        Ok(())
    }

    async fn invalidate(&self, id: &str) -> Result<(), StorageError> {
        self.check()?;
        let failing = self
            .failing_invalidations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Backend("injected invalidation failure".into()));
        }
        self.inner.invalidate(id).await
    }
}

/// Primary store that commits one repository write right before its next scan,
/// i.e. after a sync worker took its ticket but before it read the page.
struct RacingPrimary {
    inner: MemoryPrimaryStore,
    before_scan: Mutex<Option<(CompositeRepository, Record)>>,
}

impl RacingPrimary {
    fn new() -> Self {
        Self {
            inner: MemoryPrimaryStore::new(),
            before_scan: Mutex::new(None),
        }
    }

    fn race_next_scan(&self, repo: &CompositeRepository, update: Record) {
        *self.before_scan.lock() = Some((repo.clone(), update));
    }
}

#[async_trait]
impl PrimaryStore for RacingPrimary {
    async fn get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        self.inner.get(id).await
    }

    async fn add(&self, record: &Record) -> Result<Record, StorageError> {
        self.inner.add(record).await
    }

    async fn update(&self, record: &Record) -> Result<Record, StorageError> {
        self.inner.update(record).await
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.inner.delete(id).await
    }

    async fn scan_since(&self, cursor: &SyncCursor, limit: usize) -> Result<Vec<Record>, StorageError> {
        let pending = self.before_scan.lock().take();
        if let Some((repo, update)) = pending {
            repo.update(update).await?;
        }
        self.inner.scan_since(cursor, limit).await
    }

    async fn list(&self, offset: u64, limit: usize) -> Result<Vec<Record>, StorageError> {
        self.inner.list(offset, limit).await
    }

    async fn count_all(&self) -> Result<u64, StorageError> {
        self.inner.count_all().await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn kind() -> RecordKind {
    RecordKind::new("citizens").unwrap()
}

fn chaos_config() -> WorkerConfig {
    WorkerConfig {
        interval_ms: 10,
        retry_budget: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 2,
        batch_size: 10,
        cursor_overlap_ms: 0,
        fault_backoff_ms: 30,
        ..Default::default()
    }
}

async fn seed(primary: &MemoryPrimaryStore, n: usize) -> Vec<Record> {
    seed_from(primary, 0, n).await
}

async fn seed_from(primary: &MemoryPrimaryStore, first: usize, n: usize) -> Vec<Record> {
    let mut stored = Vec::with_capacity(n);
    for i in first..first + n {
        stored.push(primary.add(&Record::new(format!("r{}", i), json!({"n": i}))).await.unwrap());
    }
    stored
}

// =============================================================================
// Tier outages on the request path
// =============================================================================

#[tokio::test]
async fn chaos_cache_outage_reads_fall_through() {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let cache = Arc::new(FailingSecondary::new(TierKind::Cache));
    let document = Arc::new(MemorySecondaryStore::document());
    let tiers = TierSet::new(kind(), primary.clone())
        .with_cache(cache.clone())
        .with_document(document.clone());
    let repo = CompositeRepository::new(&tiers);

    primary.add(&Record::new("abc", json!("truth"))).await.unwrap();
    cache.set_down(true);

    let read = repo.get("abc").await.unwrap();
    assert_eq!(read.payload, json!("truth"));
    assert!(repo.exists("abc").await.unwrap());
}

#[tokio::test]
async fn chaos_write_succeeds_when_invalidation_fails() {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let cache = Arc::new(FailingSecondary::new(TierKind::Cache));
    let tiers = TierSet::new(kind(), primary.clone()).with_cache(cache.clone());
    let repo = CompositeRepository::new(&tiers);

    let v1 = repo.add(Record::new("abc", json!(1))).await.unwrap();
    cache.set_down(true);

    let v2 = repo.update(v1.with_payload(json!(2))).await.unwrap();
    assert_eq!(v2.version, 2);
    assert_eq!(primary.get("abc").await.unwrap().unwrap().payload, json!(2));

    // Administrative invalidation surfaces the failure instead
    assert!(repo.invalidate("abc").await.is_err());
    cache.heal();
    repo.invalidate("abc").await.unwrap();
}

#[tokio::test]
async fn chaos_document_outage_does_not_affect_cache_tier() {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let cache = Arc::new(MemorySecondaryStore::cache());
    let document = Arc::new(FailingSecondary::new(TierKind::Document));
    let tiers = TierSet::new(kind(), primary.clone())
        .with_cache(cache.clone())
        .with_document(document.clone());
    let cursors = Arc::new(MemoryCursorStore::new());
    seed(&primary, 4).await;
    document.set_down(true);

    let cache_worker = SyncWorker::new(&tiers, TierKind::Cache, cursors.clone(), chaos_config()).unwrap();
    let document_worker = SyncWorker::new(&tiers, TierKind::Document, cursors.clone(), chaos_config()).unwrap();

    assert!(document_worker.run_cycle().await.is_faulted());
    let report = cache_worker.run_cycle().await.report().cloned().unwrap();
    assert_eq!(report.propagated, 4);
    assert_eq!(cache.len(), 4);
    assert_eq!(document_worker.state(), WorkerState::Faulted);
    assert_eq!(cache_worker.state(), WorkerState::Idle);
}

#[tokio::test]
async fn chaos_circuit_opens_on_dead_cache() {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let cache = Arc::new(FailingSecondary::new(TierKind::Cache));
    let tiers = TierSet::new(kind(), primary.clone()).with_cache(cache.clone());
    let circuits = Arc::new(TierCircuits::with_config(CircuitConfig {
        failure_threshold: 3,
        success_threshold: 1,
        recovery_timeout: Duration::from_secs(60),
    }));
    let repo = CompositeRepository::new(&tiers).with_circuits(circuits.clone());

    primary.add(&Record::new("abc", json!(1))).await.unwrap();
    cache.set_down(true);

    for _ in 0..10 {
        assert_eq!(repo.get("abc").await.unwrap().payload, json!(1));
    }

    let breaker = circuits.for_tier(TierKind::Cache).unwrap();
    assert!(breaker.rejections() > 0, "breaker should shed load from the dead tier");
    assert!(breaker.failures() < 10);
}

// =============================================================================
// Sync worker under failure
// =============================================================================

#[tokio::test]
async fn chaos_flaky_puts_are_retried() {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let cache = Arc::new(FailingSecondary::new(TierKind::Cache));
    let tiers = TierSet::new(kind(), primary.clone()).with_cache(cache.clone());
    seed(&primary, 3).await;

    // One failure per record fits inside a budget of two attempts
    cache.flaky_puts.store(1, Ordering::SeqCst);
    let worker = SyncWorker::new(&tiers, TierKind::Cache, Arc::new(MemoryCursorStore::new()), chaos_config()).unwrap();

    let report = worker.run_cycle().await.report().cloned().unwrap();
    assert_eq!(report.propagated, 3);
    assert_eq!(report.skipped, 0);
}

#[tokio::test]
async fn chaos_poison_record_is_skipped_and_cursor_moves_on() {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let cache = Arc::new(FailingSecondary::new(TierKind::Cache));
    let tiers = TierSet::new(kind(), primary.clone()).with_cache(cache.clone());
    let cursors = Arc::new(MemoryCursorStore::new());
    let stored = seed(&primary, 5).await;
    cache.poison("r0");

    let worker = SyncWorker::new(&tiers, TierKind::Cache, cursors.clone(), chaos_config()).unwrap();
    let report = match worker.run_cycle().await {
        CycleOutcome::Completed(report) => report,
        other => panic!("a partial failure must not fault the cycle: {other:?}"),
    };
    assert_eq!(report.propagated, 4);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(cache.peek("r4").is_some(), "records after the poison still land");
    assert!(cache.peek("r0").is_none());
    assert_eq!(tiers.invalidations.unrepaired_len(TierKind::Cache), 1);

    // The cursor moves past every record that made it
    let cursor = cursors.load(TierKind::Cache, &kind()).await.unwrap();
    assert_eq!(cursor, SyncCursor::at(&stored[4]));

    // Later records keep advancing it while the poison stays queued
    let later = seed_from(&primary, 5, 3).await;
    for _ in 0..3 {
        let report = worker.run_cycle().await.report().cloned().unwrap();
        assert_eq!(report.unrepaired, 1);
        assert_eq!(report.repaired, 0);
    }
    let cursor = cursors.load(TierKind::Cache, &kind()).await.unwrap();
    assert_eq!(cursor, SyncCursor::at(&later[2]));
    assert!(cache.peek("r7").is_some());

    // Once healed, the queued record is repaired without rescanning
    cache.heal();
    let report = worker.run_cycle().await.report().cloned().unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(report.scanned, 0);
    assert_eq!(cache.peek("r0"), Some(stored[0].clone()));
    assert_eq!(tiers.invalidations.unrepaired_len(TierKind::Cache), 0);
}

#[tokio::test]
async fn chaos_total_failure_faults_then_recovers() {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let cache = Arc::new(FailingSecondary::new(TierKind::Cache));
    let tiers = TierSet::new(kind(), primary.clone()).with_cache(cache.clone());
    seed(&primary, 3).await;
    cache.set_down(true);

    let worker = Arc::new(
        SyncWorker::new(&tiers, TierKind::Cache, Arc::new(MemoryCursorStore::new()), chaos_config()).unwrap(),
    );
    let mut states = worker.state_receiver();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(shutdown_rx).await }
    });

    tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == WorkerState::Faulted))
        .await
        .unwrap()
        .unwrap();
    assert!(worker.status().consecutive_faults >= 1);

    cache.heal();
    tokio::time::timeout(Duration::from_secs(2), async {
        while cache.peek("r2").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(worker.status().consecutive_faults, 0);
}

#[tokio::test]
async fn chaos_overlapping_cycles_are_skipped() {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let cache = Arc::new(FailingSecondary::new(TierKind::Cache));
    let tiers = TierSet::new(kind(), primary.clone()).with_cache(cache.clone());
    seed(&primary, 3).await;
    *cache.put_delay.lock() = Duration::from_millis(50);

    let worker = Arc::new(
        SyncWorker::new(&tiers, TierKind::Cache, Arc::new(MemoryCursorStore::new()), chaos_config()).unwrap(),
    );
    let slow = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run_cycle().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(worker.is_syncing());
    assert!(worker.run_cycle().await.is_skipped());
    assert!(worker.reconcile(10).await.unwrap().busy);

    let first = slow.await.unwrap();
    assert_eq!(first.report().unwrap().propagated, 3);
    assert!(!worker.is_syncing());
}

// =============================================================================
// Races between the request path and the tiers
// =============================================================================

#[tokio::test]
async fn chaos_slow_population_never_serves_the_pre_update_payload() {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let cache = Arc::new(FailingSecondary::new(TierKind::Cache));
    let tiers = TierSet::new(kind(), primary.clone()).with_cache(cache.clone());
    let repo = CompositeRepository::new(&tiers);
    let v1 = repo.add(Record::new("abc", json!("x"))).await.unwrap();

    // The copy lands 30ms after the read, its acknowledgement much later
    *cache.put_delay.lock() = Duration::from_millis(30);
    *cache.ack_delay.lock() = Duration::from_millis(200);
    assert_eq!(repo.get("abc").await.unwrap().payload, json!("x"));
    let v2 = repo.update(v1.with_payload(json!("y"))).await.unwrap();

    let mut stale = 0;
    for _ in 0..40 {
        if repo.get("abc").await.unwrap().payload != json!("y") {
            stale += 1;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(stale, 0, "reads after the update returned the old payload");

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(cache.peek("abc").map_or(true, |copy| copy == v2));
}

#[tokio::test]
async fn chaos_worker_page_racing_a_write_converges() {
    let primary = Arc::new(RacingPrimary::new());
    let cache = Arc::new(MemorySecondaryStore::cache());
    let tiers = TierSet::new(kind(), primary.clone()).with_cache(cache.clone());
    let repo = CompositeRepository::new(&tiers);
    let cursors = Arc::new(MemoryCursorStore::new());
    let v1 = repo.add(Record::new("abc", json!("x"))).await.unwrap();
    let worker = SyncWorker::new(&tiers, TierKind::Cache, cursors.clone(), chaos_config()).unwrap();

    primary.race_next_scan(&repo, v1.with_payload(json!("y")));
    let report = worker.run_cycle().await.report().cloned().unwrap();

    assert_eq!(report.propagated, 1);
    assert_eq!(report.skipped, 0);
    let copy = cache.peek("abc").expect("the raced record still reaches the tier");
    assert_eq!(copy.version, 2);
    assert_eq!(copy.payload, json!("y"));

    // Later cycles move on and leave the copy alone
    let later = primary.add(&Record::new("later", json!(1))).await.unwrap();
    for _ in 0..3 {
        worker.run_cycle().await;
    }
    assert_eq!(cache.peek("abc").unwrap().payload, json!("y"));
    assert_eq!(cursors.load(TierKind::Cache, &kind()).await.unwrap(), SyncCursor::at(&later));
}

#[tokio::test]
async fn chaos_lost_delete_invalidation_is_repaired() {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let document = Arc::new(FailingSecondary::new(TierKind::Document));
    let tiers = TierSet::new(kind(), primary.clone()).with_document(document.clone());
    let repo = CompositeRepository::new(&tiers);
    let v1 = repo.add(Record::new("abc", json!("x"))).await.unwrap();
    document.put(&v1, None).await.unwrap();

    document.failing_invalidations.store(1, Ordering::SeqCst);
    repo.delete("abc").await.unwrap();
    assert!(document.peek("abc").is_some(), "the invalidation was lost");

    // The tombstone hides the leftover copy until it is removed
    assert_eq!(repo.get("abc").await.unwrap_err(), StorageError::NotFound);
    assert!(!repo.exists("abc").await.unwrap());
    assert_eq!(tiers.invalidations.unrepaired_len(TierKind::Document), 1);

    let worker =
        SyncWorker::new(&tiers, TierKind::Document, Arc::new(MemoryCursorStore::new()), chaos_config()).unwrap();
    let report = worker.run_cycle().await.report().cloned().unwrap();

    assert_eq!(report.repaired, 1);
    assert!(document.peek("abc").is_none());
    assert_eq!(tiers.invalidations.unrepaired_len(TierKind::Document), 0);
    assert_eq!(repo.get("abc").await.unwrap_err(), StorageError::NotFound);
}

#[tokio::test]
async fn chaos_lost_update_invalidation_is_repaired() {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let cache = Arc::new(FailingSecondary::new(TierKind::Cache));
    let tiers = TierSet::new(kind(), primary.clone()).with_cache(cache.clone());
    let repo = CompositeRepository::new(&tiers);
    let v1 = repo.add(Record::new("abc", json!("x"))).await.unwrap();
    cache.put(&v1, None).await.unwrap();

    cache.failing_invalidations.store(1, Ordering::SeqCst);
    let v2 = repo.update(v1.with_payload(json!("y"))).await.unwrap();
    assert_eq!(cache.peek("abc"), Some(v1));
    assert_eq!(repo.get("abc").await.unwrap(), v2);

    let worker = SyncWorker::new(&tiers, TierKind::Cache, Arc::new(MemoryCursorStore::new()), chaos_config()).unwrap();
    let report = worker.run_cycle().await.report().cloned().unwrap();

    assert_eq!(report.repaired, 1);
    assert_eq!(cache.peek("abc"), Some(v2));
}
