// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker pattern using recloser crate.
//!
//! Guards the secondary tiers (cache, document) on the request path. A tier
//! whose breaker is open is skipped exactly like an unavailable tier, so a
//! dead Redis costs one rejected future instead of a connection timeout per
//! read.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Tier unhealthy, requests fail-fast without attempting
//! - HalfOpen: Testing if the tier recovered, limited requests allowed

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::storage::traits::StorageError;
use crate::tier::TierKind;

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::HalfOpen,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

impl CircuitError<StorageError> {
    /// Collapse into a storage error; a rejection reads as the tier being down.
    pub fn into_storage(self, tier: TierKind) -> StorageError {
        match self {
            CircuitError::Rejected => StorageError::unavailable(tier, "circuit open"),
            CircuitError::Inner(e) => e,
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failures (per hundred calls) that trip the circuit
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open)
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Lenient config for less critical paths (tolerates more failures)
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(15),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    // Last state observed through call outcomes
    state: AtomicU8,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_threshold as f32 / 100.0)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Circuit state as last observed.
    ///
    /// recloser keeps its state private; a rejection means open, a success
    /// means closed. Failures leave the last observation unchanged.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Execute an async operation through the circuit breaker
    ///
    /// Takes a closure that returns a Future, allowing lazy evaluation
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.state.store(CircuitState::Closed as u8, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call succeeded");
                crate::metrics::record_circuit_breaker_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                self.state.store(CircuitState::Open as u8, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_breaker_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_breaker_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }

    pub fn reset_metrics(&self) {
        self.calls_total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }
}

/// One breaker per secondary tier.
///
/// The primary store has no breaker: it is the source of truth and its
/// failures must surface to the caller unchanged.
pub struct TierCircuits {
    pub cache: CircuitBreaker,
    pub document: CircuitBreaker,
}

impl Default for TierCircuits {
    fn default() -> Self {
        Self::new()
    }
}

impl TierCircuits {
    pub fn new() -> Self {
        Self {
            // Cache: lenient, a miss only costs a slower read
            cache: CircuitBreaker::new("cache_tier", CircuitConfig::lenient()),
            document: CircuitBreaker::new("document_tier", CircuitConfig::default()),
        }
    }

    /// Same config for both tiers.
    pub fn with_config(config: CircuitConfig) -> Self {
        Self {
            cache: CircuitBreaker::new("cache_tier", config.clone()),
            document: CircuitBreaker::new("document_tier", config),
        }
    }

    /// Breaker guarding `tier`, `None` for the primary.
    #[must_use]
    pub fn for_tier(&self, tier: TierKind) -> Option<&CircuitBreaker> {
        match tier {
            TierKind::Cache => Some(&self.cache),
            TierKind::Document => Some(&self.document),
            TierKind::Primary => None,
        }
    }

    pub fn metrics(&self) -> TierCircuitMetrics {
        TierCircuitMetrics {
            cache_calls: self.cache.calls_total(),
            cache_successes: self.cache.successes(),
            cache_failures: self.cache.failures(),
            cache_rejections: self.cache.rejections(),
            document_calls: self.document.calls_total(),
            document_successes: self.document.successes(),
            document_failures: self.document.failures(),
            document_rejections: self.document.rejections(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TierCircuitMetrics {
    pub cache_calls: u64,
    pub cache_successes: u64,
    pub cache_failures: u64,
    pub cache_rejections: u64,
    pub document_calls: u64,
    pub document_successes: u64,
    pub document_failures: u64,
    pub document_rejections: u64,
}
