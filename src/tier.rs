// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store tier descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the storage tiers a record can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// Durable source of truth (relational rows)
    Primary,
    /// Fast key-value cache
    Cache,
    /// Denormalized document store
    Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyClass {
    Fast,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Durable,
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Written on the request path
    Synchronous,
    /// Written by the sync worker or by read population
    Asynchronous,
}

/// Static characteristics of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierProfile {
    pub kind: TierKind,
    pub latency: LatencyClass,
    pub durability: Durability,
    pub write_policy: WritePolicy,
}

impl TierKind {
    #[must_use]
    pub fn profile(self) -> TierProfile {
        let (latency, durability, write_policy) = match self {
            Self::Primary => (LatencyClass::Slow, Durability::Durable, WritePolicy::Synchronous),
            Self::Cache => (LatencyClass::Fast, Durability::Ephemeral, WritePolicy::Asynchronous),
            Self::Document => (LatencyClass::Fast, Durability::Durable, WritePolicy::Asynchronous),
        };
        TierProfile {
            kind: self,
            latency,
            durability,
            write_policy,
        }
    }

    /// Stable lowercase label (metrics, cursor keys, logs).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Cache => "cache",
            Self::Document => "document",
        }
    }

    #[must_use]
    pub fn is_secondary(self) -> bool {
        !matches!(self, Self::Primary)
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
