// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record data structure.
//!
//! The [`Record`] is the unit of synchronization that flows between the
//! primary store and the secondary tiers. Each record has an opaque ID,
//! a version, a last-modified timestamp and a JSON payload.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::storage::traits::StorageError;

/// A versioned, timestamped entity payload.
///
/// # Example
///
/// ```
/// use tier_sync::Record;
/// use serde_json::json;
///
/// let record = Record::new("abc", json!({"name": "Alice"}));
///
/// assert_eq!(record.id, "abc");
/// assert_eq!(record.version, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Opaque identifier, stable across all tiers
    pub id: String,
    /// Version number (starts at 1, incremented by each primary update)
    pub version: u64,
    /// Last update timestamp (epoch millis), assigned by the primary store
    pub updated_at: i64,
    /// The serialized shape of the domain entity
    pub payload: Value,
}

impl Record {
    /// Create a new record at version 1.
    ///
    /// `updated_at` is provisional; the primary store stamps it on write.
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            version: 1,
            updated_at: now_millis(),
            payload,
        }
    }

    /// Rebuild a record from stored fields.
    pub fn reconstruct(id: String, version: u64, updated_at: i64, payload: Value) -> Self {
        Self {
            id,
            version,
            updated_at,
            payload,
        }
    }

    /// Build a record from a typed entity.
    pub fn from_entity<T: Serialize>(id: impl Into<String>, entity: &T) -> Result<Self, StorageError> {
        let payload = serde_json::to_value(entity)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Self::new(id, payload))
    }

    /// Copy of this record carrying `payload`, keeping id and version.
    ///
    /// Used to prepare an update: the version stays at the value the caller
    /// read, which the primary store checks before applying.
    #[must_use]
    pub fn with_payload(&self, payload: Value) -> Self {
        Self {
            id: self.id.clone(),
            version: self.version,
            updated_at: self.updated_at,
            payload,
        }
    }

    /// Decode the payload into a typed entity.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Hex SHA-256 of the payload's JSON encoding.
    #[must_use]
    pub fn payload_hash(&self) -> String {
        let bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Approximate encoded size in bytes (for batch metrics).
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.id.len() + self.payload.to_string().len() + 16
    }
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Strictly increasing millisecond clock for `updated_at` stamps.
///
/// Two writes through the same store never share a timestamp, so a scan
/// resuming from a cursor cannot skip a record written in the same millisecond.
#[derive(Debug, Default)]
pub(crate) struct WriteClock {
    last: AtomicI64,
}

impl WriteClock {
    pub(crate) fn stamp(&self) -> i64 {
        let now = now_millis();
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(prev + 1)
    }
}

/// Name of a record type.
///
/// Used as the primary table name, the document collection prefix and the
/// cache key namespace, so it is restricted to `[a-z_][a-z0-9_]{0,62}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKind(String);

impl RecordKind {
    pub fn new(name: impl Into<String>) -> Result<Self, StorageError> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_head = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
        let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid_head || !valid_tail || name.len() > 63 {
            return Err(StorageError::InvalidKind(name));
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
