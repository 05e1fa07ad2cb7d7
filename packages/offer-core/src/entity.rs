//! Durable CRUD over records with a write-through read cache.
//!
//! # The Contract
//!
//! 1. **Durable first.** `set` writes the durable store before touching the
//!    cache. A failed write leaves the cache as it was.
//!
//! 2. **Cache is a hint.** `get` may answer from the cache for up to the TTL.
//!    Anything that decides whether a mutation is safe reads the durable store
//!    (see [`TransactionalStore`](crate::TransactionalStore)).
//!
//! 3. **Inactive is terminal.** `inactivate` flips `active` and persists.
//!    Nothing in the core flips it back.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::RecordCache;
use crate::error::CoreError;
use crate::record::{storage_key, Entity, RecordData};
use crate::store::{DurableStore, StoreError};

/// Typed CRUD for one record namespace.
pub struct EntityStore<T> {
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn RecordCache>,
    cache_ttl: Duration,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for EntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cache: self.cache.clone(),
            cache_ttl: self.cache_ttl,
            _record: PhantomData,
        }
    }
}

impl<T: RecordData> EntityStore<T> {
    pub fn new(
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn RecordCache>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            cache_ttl,
            _record: PhantomData,
        }
    }

    /// Load a record, from the cache if fresh, otherwise from the durable store.
    pub async fn get(&self, id: &str) -> Result<Entity<T>, CoreError> {
        let key = storage_key::<T>(id);

        if let Some(cached) = self.cache.get(&key) {
            return Ok(serde_json::from_slice(&cached)?);
        }

        self.load(id).await
    }

    /// Load a record from the durable store, bypassing the cache, and refresh
    /// the cache with what was read.
    pub async fn load(&self, id: &str) -> Result<Entity<T>, CoreError> {
        let key = storage_key::<T>(id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| CoreError::RecordNotFound { key: key.clone() })?;

        let entity = serde_json::from_slice(&raw)?;
        self.cache.put(&key, Arc::new(raw), self.cache_ttl);
        Ok(entity)
    }

    /// Persist a record. Refreshes `updated_at`, writes the durable store, then
    /// the cache.
    pub async fn set(&self, entity: &mut Entity<T>) -> Result<(), CoreError> {
        entity.touch();
        let key = entity.key();
        let raw = serde_json::to_vec(entity)?;

        self.store.put(&key, raw.clone()).await?;
        self.cache.put(&key, Arc::new(raw), self.cache_ttl);
        Ok(())
    }

    /// Persist a new record, failing with [`StoreError::Conflict`] if the id
    /// is already taken.
    pub async fn create(&self, entity: &mut Entity<T>) -> Result<(), CoreError> {
        entity.touch();
        let key = entity.key();
        let raw = serde_json::to_vec(entity)?;

        self.store
            .compare_and_swap(&key, None, Some(raw.clone()))
            .await?;
        self.cache.put(&key, Arc::new(raw), self.cache_ttl);
        debug!(key = %key, "record created");
        Ok(())
    }

    /// Mark a record permanently inactive and persist it.
    pub async fn inactivate(&self, entity: &mut Entity<T>) -> Result<(), CoreError> {
        entity.active = false;
        self.set(entity).await?;
        debug!(key = %entity.key(), "record inactivated");
        Ok(())
    }

    /// Remove a record from the durable store and drop its cache entry.
    pub async fn delete(&self, id: &str) -> Result<(), CoreError> {
        let key = storage_key::<T>(id);
        self.store.delete(&key).await?;
        self.cache.evict(&key);
        debug!(key = %key, "record deleted");
        Ok(())
    }

    /// Drop the cache entry for `id` without touching the durable store.
    pub fn evict(&self, id: &str) {
        self.cache.evict(&storage_key::<T>(id));
    }

    /// Every record in this namespace, read from the durable store.
    pub async fn list(&self) -> Result<Vec<Entity<T>>, CoreError> {
        let prefix = format!("{}/", T::NAMESPACE);
        self.store
            .scan_prefix(&prefix)
            .await?
            .into_iter()
            .map(|(_, raw)| serde_json::from_slice(&raw).map_err(CoreError::from))
            .collect()
    }

    /// Every active record in this namespace.
    pub async fn list_active(&self) -> Result<Vec<Entity<T>>, CoreError> {
        let mut entities = self.list().await?;
        entities.retain(|e| e.active);
        Ok(entities)
    }

    pub(crate) fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub(crate) fn cache_raw(&self, key: &str, raw: Vec<u8>) {
        self.cache.put(key, Arc::new(raw), self.cache_ttl);
    }

    pub(crate) fn evict_key(&self, key: &str) {
        self.cache.evict(key);
    }
}

/// Conflict on `create` means the id is taken.
pub fn is_conflict(err: &CoreError) -> bool {
    matches!(err, CoreError::Store(StoreError::Conflict))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::store::MemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Tipjar {
        owner: String,
        collected: u64,
    }

    impl RecordData for Tipjar {
        const NAMESPACE: &'static str = "tipjar";
    }

    fn tipjars() -> (EntityStore<Tipjar>, Arc<MemoryStore>, Arc<TtlCache>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(TtlCache::new());
        let entities = EntityStore::new(store.clone(), cache.clone(), Duration::from_secs(300));
        (entities, store, cache)
    }

    fn jar(id: &str) -> Entity<Tipjar> {
        Entity::new(
            id,
            Tipjar {
                owner: "alice".into(),
                collected: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (entities, _, _) = tipjars();
        let result = entities.get("tipjar:none").await;
        assert!(matches!(result, Err(CoreError::RecordNotFound { key }) if key == "tipjar/tipjar:none"));
    }

    #[tokio::test]
    async fn test_set_then_get_after_eviction_reads_durable_store() {
        let (entities, _, cache) = tipjars();
        let mut record = jar("tipjar:1");
        entities.set(&mut record).await.unwrap();

        record.data.collected = 500;
        entities.set(&mut record).await.unwrap();

        cache.clear();
        let loaded = entities.get("tipjar:1").await.unwrap();
        assert_eq!(loaded.data.collected, 500);
    }

    #[tokio::test]
    async fn test_set_refreshes_updated_at() {
        let (entities, _, _) = tipjars();
        let mut record = jar("tipjar:1");
        let created = record.updated_at;

        tokio::time::sleep(Duration::from_millis(5)).await;
        entities.set(&mut record).await.unwrap();

        assert!(record.updated_at > created);
        assert_eq!(record.created_at, created);
    }

    #[tokio::test]
    async fn test_durable_store_wins_over_stale_cache_on_load() {
        let (entities, store, _) = tipjars();
        let mut record = jar("tipjar:1");
        entities.set(&mut record).await.unwrap();

        // Another process writes directly to the shared store.
        let mut external = record.clone();
        external.data.collected = 99;
        store
            .put("tipjar/tipjar:1", serde_json::to_vec(&external).unwrap())
            .await
            .unwrap();

        assert_eq!(entities.get("tipjar:1").await.unwrap().data.collected, 0);
        assert_eq!(entities.load("tipjar:1").await.unwrap().data.collected, 99);
        assert_eq!(entities.get("tipjar:1").await.unwrap().data.collected, 99);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let (entities, _, _) = tipjars();
        entities.create(&mut jar("tipjar:1")).await.unwrap();

        let err = entities.create(&mut jar("tipjar:1")).await.unwrap_err();
        assert!(is_conflict(&err));
    }

    #[tokio::test]
    async fn test_inactivate_and_list_active() {
        let (entities, _, _) = tipjars();
        let mut a = jar("tipjar:a");
        let mut b = jar("tipjar:b");
        entities.set(&mut a).await.unwrap();
        entities.set(&mut b).await.unwrap();

        entities.inactivate(&mut a).await.unwrap();
        entities.evict("tipjar:a");

        assert!(!entities.get("tipjar:a").await.unwrap().active);
        let active: Vec<String> = entities
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(active, vec!["tipjar:b".to_string()]);
        assert_eq!(entities.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_cache() {
        let (entities, store, cache) = tipjars();
        entities.set(&mut jar("tipjar:1")).await.unwrap();

        entities.delete("tipjar:1").await.unwrap();

        assert!(store.is_empty().await);
        assert!(cache.is_empty());
        assert!(matches!(
            entities.get("tipjar:1").await,
            Err(CoreError::RecordNotFound { .. })
        ));
    }
}
