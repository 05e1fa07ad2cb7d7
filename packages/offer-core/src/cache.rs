//! Short-lived read cache in front of the durable store.
//!
//! The cache only reduces read latency. It is write-through (populated after a
//! successful durable write) and never consulted to decide whether a mutation
//! is safe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Get/set-with-TTL storage for encoded records.
///
/// Any implementation is substitutable; correctness never depends on it.
pub trait RecordCache: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<Arc<Vec<u8>>>;

    fn put(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration);

    fn evict(&self, key: &str);
}

/// In-process TTL cache on a concurrent map.
#[derive(Default)]
pub struct TtlCache {
    entries: DashMap<String, (Arc<Vec<u8>>, Instant)>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl RecordCache for TtlCache {
    fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let hit = self.entries.get(key).and_then(|entry| {
            let (value, expires_at) = entry.value();
            (*expires_at > Instant::now()).then(|| value.clone())
        });

        if hit.is_none() {
            self.entries
                .remove_if(key, |_, (_, expires_at)| *expires_at <= Instant::now());
        }
        hit
    }

    fn put(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration) {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
    }

    fn evict(&self, key: &str) {
        self.entries.remove(key);
    }
}
