// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Asynchronous backfill of the secondary tiers.
//!
//! One [`SyncWorker`] per (secondary tier, record kind) pulls changes from
//! the primary store by cursor and pushes them into its tier.
//! [`SyncSupervisor`] runs a kind's workers and stops them together.

mod types;
mod worker;
mod supervisor;

pub use supervisor::SyncSupervisor;
pub use types::{CycleOutcome, ReconcileReport, SyncReport, SyncStatus, WorkerState};
pub use worker::SyncWorker;
