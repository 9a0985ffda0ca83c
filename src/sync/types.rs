//! Public types for the sync workers.

use serde::Serialize;
use std::time::Duration;

use crate::cursor::SyncCursor;
use crate::tier::TierKind;

/// Most per-record errors kept in a report; the rest are only counted.
pub(crate) const MAX_REPORTED_ERRORS: usize = 16;

/// Worker lifecycle state.
///
/// ```text
/// Idle → Scanning → Propagating → Idle
///            │            │
///            └────────────┴──► Faulted ──(fault_backoff)──► Idle
/// ```
///
/// Use [`super::SyncWorker::state()`] for the current value or
/// [`super::SyncWorker::state_receiver()`] to watch transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    /// Waiting for the next tick or trigger
    Idle,
    /// Reading a page of changes from the primary store
    Scanning,
    /// Writing a page into the secondary tier
    Propagating,
    /// Last cycle failed as a whole; waiting out the fault backoff
    Faulted,
    /// Run loop has exited
    Stopped,
}

impl WorkerState {
    /// Numeric value for the state gauge.
    #[must_use]
    pub fn as_gauge(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Scanning => 1,
            Self::Propagating => 2,
            Self::Faulted => 3,
            Self::Stopped => 4,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Propagating => write!(f, "Propagating"),
            Self::Faulted => write!(f, "Faulted"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What one sync cycle did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub tier: TierKind,
    pub kind: String,
    /// Records read from the primary (overlap re-reads included)
    pub scanned: usize,
    pub propagated: usize,
    /// Records that exhausted their retry budget (queued for repair)
    pub skipped: usize,
    /// Queued ids brought in line before the scan
    pub repaired: usize,
    /// Queued ids that failed again and stay queued
    pub unrepaired: usize,
    /// First few per-record failures, as `id: error`
    pub errors: Vec<String>,
    pub duration: Duration,
    /// Persisted cursor at the end of the cycle
    pub cursor: SyncCursor,
}

impl SyncReport {
    pub(crate) fn new(tier: TierKind, kind: &str, cursor: SyncCursor) -> Self {
        Self {
            tier,
            kind: kind.to_string(),
            scanned: 0,
            propagated: 0,
            skipped: 0,
            repaired: 0,
            unrepaired: 0,
            errors: Vec::new(),
            duration: Duration::ZERO,
            cursor,
        }
    }

    pub(crate) fn note_error(&mut self, id: &str, error: impl std::fmt::Display) {
        self.skipped += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(format!("{}: {}", id, error));
        }
    }

    /// Every scanned record failed.
    #[must_use]
    pub fn is_total_failure(&self) -> bool {
        self.scanned > 0 && self.propagated == 0
    }
}

/// Result of asking a worker to run a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The cycle ran; some records may still have been skipped
    Completed(SyncReport),
    /// Another cycle was already running; nothing was done
    Skipped,
    /// The cycle failed as a whole and the worker entered `Faulted`
    Faulted {
        reason: String,
        report: Option<SyncReport>,
    },
}

impl CycleOutcome {
    #[must_use]
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Faulted { report, .. } => report.as_ref(),
            Self::Skipped => None,
        }
    }

    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    #[must_use]
    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted { .. })
    }
}

/// Point-in-time view of a worker for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub tier: TierKind,
    pub kind: String,
    pub state: WorkerState,
    pub is_syncing: bool,
    /// Epoch millis of the last finished cycle, successful or not
    pub last_sync_at: Option<i64>,
    pub last_successful_sync_at: Option<i64>,
    pub consecutive_faults: u32,
    pub last_report: Option<SyncReport>,
}

/// What a reconcile pass found and fixed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Primary records compared against the tier
    pub checked: usize,
    /// Copies that were missing
    pub missing: usize,
    /// Copies that were older or had a different payload
    pub drifted: usize,
    /// Copies rewritten successfully
    pub repaired: usize,
    pub failed: usize,
    /// A sync cycle held the worker; nothing was checked
    pub busy: bool,
}
