//! Durable key/value storage for records.
//!
//! # Overview
//!
//! The [`DurableStore`] is the single writable source of truth. Every
//! correctness decision in the core (is this lease free? does this record
//! exist? is it still active?) is made against it, never against the cache.
//!
//! # The Contract
//!
//! 1. **Full overwrite.** `put` replaces whatever was stored under the key.
//!
//! 2. **Compare-and-swap.** `compare_and_swap` replaces the value only if the
//!    stored bytes equal `expected` (`None` = key must be absent). This is what
//!    makes a lease transition `false → true` observable by exactly one writer,
//!    even across processes sharing the same store.
//!
//! 3. **Prefix iteration.** `scan_prefix` returns every entry whose key starts
//!    with the prefix, in key order. Namespaces are key prefixes, so this is the
//!    secondary index used for list views and restart recovery.
//!
//! # What This Does NOT Guarantee
//!
//! - No multi-key transactions.
//! - No change notifications. Cross-process lease waiters poll.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

// =============================================================================
// Store Error
// =============================================================================

/// Errors from the durable store.
///
/// This distinction is critical for correct behavior:
/// - [`StoreError::Conflict`] means another writer changed the key between our
///   read and our compare-and-swap. Re-read and decide again.
/// - [`StoreError::Backend`] means storage failed (I/O, corruption, closed).
///   This is a system-level failure.
#[derive(Debug)]
pub enum StoreError {
    /// The stored value no longer matches what the caller expected.
    Conflict,

    /// Storage backend failed.
    Backend(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "compare-and-swap conflict: value was modified concurrently"),
            StoreError::Backend(e) => write!(f, "storage backend error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Conflict => None,
            StoreError::Backend(e) => Some(e.as_ref()),
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

// =============================================================================
// Durable Store
// =============================================================================

/// Byte-oriented durable storage used by the entity and lease layers.
///
/// Implementations must be safe to share between many concurrent tasks.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Load the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically replace the value under `key` if it currently equals `expected`.
    ///
    /// `expected = None` requires the key to be absent; `new = None` deletes it.
    /// Returns [`StoreError::Conflict`] when the stored value differs.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<(), StoreError>;

    /// List every `(key, value)` whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Flush buffered writes to stable storage.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-process store backed by an ordered map.
///
/// Used in tests and for single-process deployments that accept losing
/// pending offers on restart.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<(), StoreError> {
        let mut data = self.data.write().await;

        if data.get(key).map(Vec::as_slice) != expected {
            return Err(StoreError::Conflict);
        }

        match new {
            Some(value) => {
                data.insert(key.to_string(), value);
            }
            None => {
                data.remove(key);
            }
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Store Error Tests
    // =========================================================================

    #[test]
    fn test_store_error_display() {
        let conflict = StoreError::Conflict;
        assert!(conflict.to_string().contains("conflict"));

        let backend = StoreError::Backend(anyhow::anyhow!("disk full"));
        assert!(backend.to_string().contains("disk full"));
    }

    // =========================================================================
    // MemoryStore Tests
    // =========================================================================

    #[tokio::test]
    async fn test_memory_store_get_missing() {
        let store = MemoryStore::new();
        assert!(store.get("send/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_put_overwrites() {
        let store = MemoryStore::new();
        store.put("send/1", b"a".to_vec()).await.unwrap();
        store.put("send/1", b"b".to_vec()).await.unwrap();

        assert_eq!(store.get("send/1").await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_store_delete_absent_is_ok() {
        let store = MemoryStore::new();
        store.delete("nothing").await.unwrap();
    }

    #[tokio::test]
    async fn test_compare_and_swap_requires_absence() {
        let store = MemoryStore::new();

        store
            .compare_and_swap("faucet/x", None, Some(b"v1".to_vec()))
            .await
            .unwrap();

        let second = store
            .compare_and_swap("faucet/x", None, Some(b"v2".to_vec()))
            .await;
        assert!(matches!(second, Err(StoreError::Conflict)));
        assert_eq!(store.get("faucet/x").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn test_compare_and_swap_detects_stale_expected() {
        let store = MemoryStore::new();
        store.put("faucet/x", b"v1".to_vec()).await.unwrap();

        store
            .compare_and_swap("faucet/x", Some(b"v1"), Some(b"v2".to_vec()))
            .await
            .unwrap();

        let stale = store
            .compare_and_swap("faucet/x", Some(b"v1"), Some(b"v3".to_vec()))
            .await;
        assert!(matches!(stale, Err(StoreError::Conflict)));

        store
            .compare_and_swap("faucet/x", Some(b"v2"), None)
            .await
            .unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_scan_prefix_stays_in_namespace() {
        let store = MemoryStore::new();
        store.put("event/a", b"1".to_vec()).await.unwrap();
        store.put("event/b", b"2".to_vec()).await.unwrap();
        store.put("eventual/c", b"3".to_vec()).await.unwrap();
        store.put("faucet/a", b"4".to_vec()).await.unwrap();

        let keys: Vec<String> = store
            .scan_prefix("event/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["event/a".to_string(), "event/b".to_string()]);
    }
}
