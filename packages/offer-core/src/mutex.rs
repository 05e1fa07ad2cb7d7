//! Exclusive named locks over arbitrary string keys.
//!
//! # Overview
//!
//! The [`MutexManager`] hands out one exclusive lock per key, created on first
//! use. Locks live in a concurrent map so unrelated keys never contend through
//! a single global lock.
//!
//! # Variants
//!
//! | Call                         | Released by                                   |
//! |------------------------------|-----------------------------------------------|
//! | `lock` / `unlock`            | explicit `unlock(key)`                        |
//! | `lock_guard`                 | dropping the [`KeyGuard`]                     |
//! | `lock_with_cancel`           | dropping the guard, or the token firing       |
//! | `lock_soft` / `unlock_soft`  | the owner's last `unlock_soft`                |
//! | `lock_soft_with_cancel`      | the owner's last `unlock_soft`, or the token  |
//!
//! # Soft Locks
//!
//! A soft lock tolerates re-entry by the same logical flow: a handler that
//! calls another handler locking the same object. The hold records its owner
//! ([`FlowId`]); nested `lock_soft` calls by that owner only increase a depth
//! counter, and the real unlock happens when the depth returns to zero. A
//! *different* flow calling `lock_soft` blocks like any other locker. Two tasks
//! sharing one `FlowId` concurrently are not distinguished; do not do that.
//!
//! There is no timeout on acquisition. A caller stuck forever indicates an
//! upstream bug.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::{oneshot, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CoreError;

// =============================================================================
// Flow Id
// =============================================================================

/// Identity of one logical operation (one inbound trigger and its nested calls).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowId(Uuid);

impl FlowId {
    pub fn new() -> Self {
        FlowId(Uuid::new_v4())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Key Lock
// =============================================================================

struct SoftHold {
    owner: FlowId,
    depth: usize,
}

#[derive(Default)]
struct Hold {
    guard: Option<OwnedMutexGuard<()>>,
    generation: u64,
    soft: Option<SoftHold>,
    /// Dropped on release; stops the cancellation watcher.
    watch: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct KeyLock {
    mutex: Arc<tokio::sync::Mutex<()>>,
    hold: Mutex<Hold>,
}

impl KeyLock {
    fn hold(&self) -> MutexGuard<'_, Hold> {
        // A panic while holding the state lock cannot leave it inconsistent;
        // every critical section is a handful of field assignments.
        self.hold.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install(&self, guard: OwnedMutexGuard<()>, soft: Option<FlowId>) -> u64 {
        let mut hold = self.hold();
        hold.generation = hold.generation.wrapping_add(1);
        hold.guard = Some(guard);
        hold.soft = soft.map(|owner| SoftHold { owner, depth: 1 });
        hold.generation
    }

    /// Release the current hold. With `expected`, only if it is still that
    /// generation. Returns whether a hold was released.
    fn release(&self, expected: Option<u64>) -> bool {
        let (guard, watch) = {
            let mut hold = self.hold();
            if hold.guard.is_none() {
                return false;
            }
            if expected.is_some_and(|generation| generation != hold.generation) {
                return false;
            }
            hold.soft = None;
            (hold.guard.take(), hold.watch.take())
        };
        drop(watch);
        drop(guard);
        true
    }

    /// Nested soft entry by the current owner.
    fn reenter(&self, owner: FlowId) -> bool {
        let mut state = self.hold();
        let hold = &mut *state;
        match hold.soft.as_mut() {
            Some(soft) if soft.owner == owner && hold.guard.is_some() => {
                soft.depth += 1;
                true
            }
            _ => false,
        }
    }

    fn is_held(&self) -> bool {
        self.hold().guard.is_some()
    }
}

// =============================================================================
// Mutex Manager
// =============================================================================

/// Process-local registry of named exclusive locks.
///
/// Cheap to clone; clones share the same locks. Construct one per service
/// instance rather than using a global.
#[derive(Clone, Default)]
pub struct MutexManager {
    locks: Arc<DashMap<String, Arc<KeyLock>>>,
}

impl MutexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is exclusively held. Release with [`unlock`](Self::unlock).
    pub async fn lock(&self, key: &str) {
        let lock = self.entry(key);
        let guard = lock.mutex.clone().lock_owned().await;
        lock.install(guard, None);
        debug!(key = %key, "locked");
    }

    /// Release `key`. No-op if it was never locked or is not held.
    pub fn unlock(&self, key: &str) {
        if let Some(lock) = self.existing(key) {
            if lock.release(None) {
                debug!(key = %key, "unlocked");
            }
        }
        self.prune(key);
    }

    /// Block until `key` is held and return a guard that releases it on drop.
    pub async fn lock_guard(&self, key: &str) -> KeyGuard {
        let lock = self.entry(key);
        let guard = lock.mutex.clone().lock_owned().await;
        let generation = lock.install(guard, None);
        KeyGuard::new(self.clone(), key, lock, generation)
    }

    /// Like [`lock_guard`](Self::lock_guard), bound to a cancellation token.
    ///
    /// Fails with [`CoreError::Cancelled`] if the token fires while waiting.
    /// If it fires while the lock is held, the lock is released so an aborted
    /// request cannot hold it indefinitely.
    pub async fn lock_with_cancel(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<KeyGuard, CoreError> {
        let lock = self.entry(key);
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                drop(lock);
                self.prune(key);
                return Err(CoreError::Cancelled { key: key.to_string() });
            }
            guard = lock.mutex.clone().lock_owned() => guard,
        };

        let generation = lock.install(guard, None);
        self.bind_to_cancel(key, &lock, generation, cancel);
        Ok(KeyGuard::new(self.clone(), key, lock, generation))
    }

    /// Re-entrant lock for `owner`. See the module docs.
    pub async fn lock_soft(&self, key: &str, owner: FlowId) {
        let lock = self.entry(key);
        if lock.reenter(owner) {
            debug!(key = %key, flow = %owner, "soft lock re-entered");
            return;
        }

        let guard = lock.mutex.clone().lock_owned().await;
        lock.install(guard, Some(owner));
        debug!(key = %key, flow = %owner, "soft locked");
    }

    /// Soft lock bound to a cancellation token.
    ///
    /// Re-entry never waits. A first entry fails with [`CoreError::Cancelled`]
    /// if the token fires while waiting, and the whole hold is released if the
    /// token fires while it is held.
    pub async fn lock_soft_with_cancel(
        &self,
        key: &str,
        owner: FlowId,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let lock = self.entry(key);
        if lock.reenter(owner) {
            return Ok(());
        }

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                drop(lock);
                self.prune(key);
                return Err(CoreError::Cancelled { key: key.to_string() });
            }
            guard = lock.mutex.clone().lock_owned() => guard,
        };

        let generation = lock.install(guard, Some(owner));
        self.bind_to_cancel(key, &lock, generation, cancel);
        Ok(())
    }

    /// Leave one level of a soft hold; the last level releases the lock.
    ///
    /// Calls from a flow that does not own the hold are ignored.
    pub fn unlock_soft(&self, key: &str, owner: FlowId) {
        let Some(lock) = self.existing(key) else {
            return;
        };

        let released = {
            let mut state = lock.hold();
            let hold = &mut *state;
            match hold.soft.as_mut() {
                Some(soft) if soft.owner == owner => {
                    soft.depth -= 1;
                    if soft.depth == 0 {
                        hold.soft = None;
                        Some((hold.guard.take(), hold.watch.take()))
                    } else {
                        None
                    }
                }
                Some(soft) => {
                    warn!(key = %key, flow = %owner, holder = %soft.owner, "soft unlock by non-owner ignored");
                    None
                }
                None => None,
            }
        };

        if let Some((guard, watch)) = released {
            drop(watch);
            drop(guard);
            debug!(key = %key, flow = %owner, "soft unlocked");
        }
        drop(lock);
        self.prune(key);
    }

    /// Whether `key` is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        self.existing(key).is_some_and(|lock| lock.is_held())
    }

    /// Number of keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn entry(&self, key: &str) -> Arc<KeyLock> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KeyLock::default()))
            .clone()
    }

    fn existing(&self, key: &str) -> Option<Arc<KeyLock>> {
        self.locks.get(key).map(|lock| lock.value().clone())
    }

    /// Drop the entry for `key` if nobody holds or waits on it.
    fn prune(&self, key: &str) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1 && !lock.is_held());
    }

    fn bind_to_cancel(
        &self,
        key: &str,
        lock: &Arc<KeyLock>,
        generation: u64,
        cancel: &CancellationToken,
    ) {
        let (tx, rx) = oneshot::channel::<()>();
        {
            let mut hold = lock.hold();
            if hold.generation != generation || hold.guard.is_none() {
                return;
            }
            hold.watch = Some(tx);
        }

        let manager = self.clone();
        let key = key.to_string();
        let lock = lock.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if lock.release(Some(generation)) {
                        warn!(key = %key, "lock released by cancellation");
                    }
                }
                _ = rx => {}
            }
            drop(lock);
            manager.prune(&key);
        });
    }
}

// =============================================================================
// Key Guard
// =============================================================================

/// An exclusive hold on one key, released when dropped.
///
/// A guard only ever releases the hold it acquired. If that hold already ended
/// (explicit `unlock`, cancellation), dropping the guard does nothing, even if
/// another caller holds the key by then.
pub struct KeyGuard {
    manager: MutexManager,
    key: String,
    lock: Option<Arc<KeyLock>>,
    generation: u64,
}

impl KeyGuard {
    fn new(manager: MutexManager, key: &str, lock: Arc<KeyLock>, generation: u64) -> Self {
        Self {
            manager,
            key: key.to_string(),
            lock: Some(lock),
            generation,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this guard's hold is still in effect.
    pub fn is_held(&self) -> bool {
        self.lock.as_ref().is_some_and(|lock| {
            let hold = lock.hold();
            hold.guard.is_some() && hold.generation == self.generation
        })
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            if lock.release(Some(self.generation)) {
                debug!(key = %self.key, "unlocked");
            }
            drop(lock);
            self.manager.prune(&self.key);
        }
    }
}

impl fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}
