// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed view over a [`CompositeRepository`].
//!
//! # Example
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use tier_sync::{CompositeRepository, TypedRepository};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Citizen {
//!     name: String,
//! }
//!
//! # async fn example(repo: CompositeRepository) -> Result<(), tier_sync::StorageError> {
//! let citizens: TypedRepository<Citizen> = TypedRepository::new(repo);
//! let (version, _) = citizens.add("abc", &Citizen { name: "Ada".into() }).await?;
//! let (version, citizen) = citizens.get("abc").await?;
//! citizens.update("abc", version, &Citizen { name: citizen.name.to_uppercase() }).await?;
//! # Ok(())
//! # }
//! ```

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::CompositeRepository;
use crate::record::Record;
use crate::storage::traits::StorageError;

/// Entity-typed repository: payloads go through serde on the way in and out.
///
/// Values come back paired with their version, which `update` needs.
pub struct TypedRepository<T> {
    inner: CompositeRepository,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedRepository<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T> TypedRepository<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(inner: CompositeRepository) -> Self {
        Self {
            inner,
            _entity: PhantomData,
        }
    }

    #[must_use]
    pub fn inner(&self) -> &CompositeRepository {
        &self.inner
    }

    pub async fn get(&self, id: &str) -> Result<(u64, T), StorageError> {
        let record = self.inner.get(id).await?;
        Ok((record.version, record.payload_as()?))
    }

    pub async fn add(&self, id: &str, entity: &T) -> Result<(u64, T), StorageError> {
        let stored = self.inner.add(Record::from_entity(id, entity)?).await?;
        Ok((stored.version, stored.payload_as()?))
    }

    /// Replace the entity, expecting `version` to be current.
    pub async fn update(&self, id: &str, version: u64, entity: &T) -> Result<u64, StorageError> {
        let mut record = Record::from_entity(id, entity)?;
        record.version = version;
        Ok(self.inner.update(record).await?.version)
    }

    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.inner.delete(id).await
    }

    pub async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        self.inner.exists(id).await
    }

    /// Page of entities ordered by id.
    pub async fn browse(&self, offset: u64, limit: usize) -> Result<Vec<(String, T)>, StorageError> {
        self.inner
            .browse(offset, limit)
            .await?
            .into_iter()
            .map(|r| Ok((r.id.clone(), r.payload_as()?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use crate::storage::memory::{MemoryPrimaryStore, MemorySecondaryStore};
    use crate::storage::TierSet;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Passport {
        holder: String,
        number: u32,
    }

    fn passports() -> TypedRepository<Passport> {
        let tiers = TierSet::new(RecordKind::new("passports").unwrap(), Arc::new(MemoryPrimaryStore::new()))
            .with_cache(Arc::new(MemorySecondaryStore::cache()));
        TypedRepository::new(CompositeRepository::new(&tiers))
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let repo = passports();
        let p = Passport { holder: "Ada".into(), number: 7 };

        let (v1, stored) = repo.add("p-1", &p).await.unwrap();
        assert_eq!(v1, 1);
        assert_eq!(stored, p);

        let renewed = Passport { number: 8, ..p.clone() };
        let v2 = repo.update("p-1", v1, &renewed).await.unwrap();
        assert_eq!(v2, 2);
        assert_eq!(repo.get("p-1").await.unwrap(), (2, renewed));

        // Stale version
        assert!(matches!(
            repo.update("p-1", v1, &p).await,
            Err(StorageError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_typed_browse_and_delete() {
        let repo = passports();
        for n in 0..3 {
            repo.add(&format!("p-{}", n), &Passport { holder: "x".into(), number: n }).await.unwrap();
        }

        let page = repo.browse(1, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].0, "p-1");

        repo.delete("p-0").await.unwrap();
        assert!(!repo.exists("p-0").await.unwrap());
    }

    #[tokio::test]
    async fn test_payload_shape_mismatch_is_serialization_error() {
        let repo = passports();
        repo.inner().add(Record::new("odd", serde_json::json!("not a passport"))).await.unwrap();

        assert!(matches!(repo.get("odd").await, Err(StorageError::Serialization(_))));
    }
}
