//! # Tier Sync
//!
//! A composite repository that serves reads from fast secondary tiers and
//! keeps them converging on a durable primary store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   CompositeRepository                       │
//! │  • get: Cache → Document → Primary, populate on the way up  │
//! │  • add / update / delete: Primary, then invalidate tiers    │
//! │  • Every operation bounded by a deadline                    │
//! └─────────────────────────────────────────────────────────────┘
//!          │ read-through                  │ write
//!          ▼                               ▼
//! ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │   Cache tier     │  │  Document tier   │  │  Primary store   │
//! │  Redis, TTL'd    │  │  JSON documents  │  │  SQL rows, OCC   │
//! │  (disposable)    │  │  (disposable)    │  │  (authoritative) │
//! └──────────────────┘  └──────────────────┘  └──────────────────┘
//!          ▲                     ▲                      │
//!          └──────── SyncWorker (one per tier) ◄────────┘
//!                    scan by cursor, put with retry
//! ```
//!
//! Secondary tiers may be stale or empty at any time. Correctness comes from
//! the primary store; the tiers only buy latency. A write invalidates every
//! tier copy, the next read repopulates it, and the sync workers backfill
//! whatever the request path never touched.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tier_sync::{CompositeRepository, Record, RecordKind, SyncSupervisor, TierSet, TierSyncConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tier_sync::StorageError> {
//!     let config = TierSyncConfig {
//!         sql_url: Some("sqlite://citizens.db?mode=rwc".into()),
//!         redis_url: Some("redis://localhost:6379".into()),
//!         cursor_path: Some("cursors.db".into()),
//!         ..Default::default()
//!     };
//!
//!     let tiers = TierSet::connect(&config, RecordKind::new("citizens")?).await?;
//!     let repository = CompositeRepository::from_config(&tiers, &config);
//!     let supervisor = SyncSupervisor::connect(&tiers, &config).await?;
//!
//!     repository.add(Record::new("abc", json!({"name": "Ada"}))).await?;
//!     let record = repository.get("abc").await?;
//!     println!("{} v{}", record.id, record.version);
//!
//!     supervisor.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`repository`]: The [`CompositeRepository`] facade and typed wrapper
//! - [`storage`]: Primary and secondary store adapters (SQL, Redis, memory)
//! - [`sync`]: Background sync workers and their supervisor
//! - [`cursor`]: Persisted sync progress
//! - [`resilience`]: Circuit breakers and retry policies
//! - [`rejection`]: Domain error to client message mapping
//! - [`registry`]: Live connection tracking

pub mod config;
pub mod cursor;
pub mod metrics;
pub mod record;
pub mod registry;
pub mod rejection;
pub mod repository;
pub mod resilience;
pub mod storage;
pub mod sync;
pub mod tier;

pub use config::{TierSyncConfig, WorkerConfig};
pub use cursor::{CursorStore, MemoryCursorStore, SqliteCursorStore, SyncCursor};
pub use metrics::LatencyTimer;
pub use record::{Record, RecordKind};
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use rejection::{CommandKind, EntityError, ErrorKind, Rejection, RejectionRegistry};
pub use repository::{Committed, CompositeRepository, Invalidate, InvalidationLog, TypedRepository};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, TierCircuits};
pub use resilience::retry::RetryConfig;
pub use storage::traits::{PrimaryScan, PrimaryStore, SecondaryStore, StorageError};
pub use storage::TierSet;
pub use sync::{CycleOutcome, ReconcileReport, SyncReport, SyncStatus, SyncSupervisor, SyncWorker, WorkerState};
pub use tier::{TierKind, TierProfile};
