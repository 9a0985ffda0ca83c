// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Owns the sync workers of one record kind: spawns them, exposes their
//! status and stops them together.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::types::SyncStatus;
use super::worker::SyncWorker;
use crate::config::TierSyncConfig;
use crate::cursor::{CursorStore, MemoryCursorStore, SqliteCursorStore};
use crate::storage::traits::StorageError;
use crate::storage::TierSet;
use crate::tier::TierKind;

pub struct SyncSupervisor {
    workers: Vec<Arc<SyncWorker>>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncSupervisor {
    /// Spawn the run loop of every worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(workers: Vec<Arc<SyncWorker>>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let handles = workers
            .iter()
            .map(|worker| {
                let worker = worker.clone();
                let rx = shutdown.subscribe();
                tokio::spawn(async move { worker.run(rx).await })
            })
            .collect();

        info!(workers = workers.len(), "Sync supervisor started");
        Self {
            workers,
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    /// One worker per enabled, wired secondary tier, using `config`'s
    /// per-tier settings. Cache entries written by the worker get `cache_ttl`.
    pub fn start(tiers: &TierSet, cursors: Arc<dyn CursorStore>, config: &TierSyncConfig) -> Result<Self, StorageError> {
        let mut workers = Vec::new();
        for (tier, worker_config, ttl) in [
            (TierKind::Cache, &config.cache, config.cache_ttl()),
            (TierKind::Document, &config.document, None),
        ] {
            if !worker_config.enabled {
                info!(tier = %tier, "Sync worker disabled by config");
                continue;
            }
            if tiers.secondary(tier).is_none() {
                continue;
            }
            let worker = SyncWorker::new(tiers, tier, cursors.clone(), worker_config.clone())?.with_ttl(ttl);
            workers.push(Arc::new(worker));
        }
        Ok(Self::spawn(workers))
    }

    /// Like [`start`](Self::start), opening the cursor store named by
    /// `cursor_path` (in-memory cursors if unset).
    pub async fn connect(tiers: &TierSet, config: &TierSyncConfig) -> Result<Self, StorageError> {
        let cursors: Arc<dyn CursorStore> = match config.cursor_path.as_deref() {
            Some(path) => Arc::new(SqliteCursorStore::open(path).await?),
            None => {
                warn!("No cursor_path configured, sync cursors will not survive a restart");
                Arc::new(MemoryCursorStore::new())
            }
        };
        Self::start(tiers, cursors, config)
    }

    #[must_use]
    pub fn workers(&self) -> &[Arc<SyncWorker>] {
        &self.workers
    }

    #[must_use]
    pub fn worker(&self, tier: TierKind) -> Option<&Arc<SyncWorker>> {
        self.workers.iter().find(|w| w.tier() == tier)
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<SyncStatus> {
        self.workers.iter().map(|w| w.status()).collect()
    }

    pub fn trigger_all(&self) {
        for worker in &self.workers {
            worker.trigger();
        }
    }

    /// Signal every worker to stop and wait for their loops to exit.
    ///
    /// A cycle in flight finishes first.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sync worker task ended abnormally");
            }
        }
        info!("Sync supervisor stopped");
    }
}

impl Drop for SyncSupervisor {
    fn drop(&mut self) {
        // Loops also exit when the sender is dropped; this just makes it explicit
        let _ = self.shutdown.send(true);
    }
}
