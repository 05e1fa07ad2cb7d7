//! Durable, exclusive leases on records.
//!
//! # Overview
//!
//! A lease is the `in_transaction` flag on a stored [`Entity`]. It is written
//! to the durable store immediately on acquisition, so it is visible to every
//! reader of that store, not merely to tasks in this process.
//!
//! # The Contract
//!
//! 1. **One winner.** Acquisition is a compare-and-swap from the exact bytes
//!    that were read (flag clear) to the same record with the flag set. Of any
//!    number of concurrent acquirers, exactly one observes `false → true`.
//!
//! 2. **Bounded waiting.** While a lease is held, waiters sleep until an
//!    in-process release wakes them or the poll interval elapses (the fallback
//!    for releases made by other processes), and give up with
//!    [`CoreError::LockTimeout`] at an absolute deadline.
//!
//! 3. **Always release.** Every `acquire` must be paired with `release`, on
//!    every exit path. [`TransactionalStore::with_lease`] does this for you,
//!    including when its future is dropped.
//!
//! 4. **Only the holder releases.** Each lease carries a `lease_token`.
//!    `release` is a compare-and-swap that succeeds only while the stored
//!    record still carries the caller's token, so a holder whose lease was
//!    reclaimed gets [`CoreError::LeaseLost`] and writes nothing.
//!
//! # Abandoned Leases
//!
//! A process that dies between `acquire` and `release` leaves the flag set.
//! When a lease TTL is configured, a lease older than the TTL is considered
//! abandoned and the next acquirer reclaims it. `force_release` is the
//! operator path when no TTL is configured.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entity::EntityStore;
use crate::error::CoreError;
use crate::record::{storage_key, Entity, RecordData};
use crate::store::StoreError;

// =============================================================================
// Lease Settings
// =============================================================================

/// Timing for lease waits and expiry.
#[derive(Debug, Clone, Copy)]
pub struct LeaseSettings {
    /// How often a waiter re-reads the durable store.
    pub poll_interval: Duration,
    /// Absolute bound on waiting for a held lease.
    pub wait_timeout: Duration,
    /// Age after which a held lease is treated as abandoned. `None` = never.
    pub ttl: Option<Duration>,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            wait_timeout: Duration::from_secs(10),
            ttl: Some(Duration::from_secs(120)),
        }
    }
}

// =============================================================================
// Lease Notifier
// =============================================================================

/// In-process wake-ups for lease waiters, keyed by record key.
///
/// Shared by every [`TransactionalStore`] built from the same services so a
/// release in one handler wakes waiters in another without polling. A key
/// has an entry only while some task is waiting in `get` or `acquire`.
#[derive(Default)]
pub struct LeaseNotifier {
    waiters: DashMap<String, Arc<Notify>>,
}

impl LeaseNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(self: &Arc<Self>, key: &str) -> LeaseWaiter {
        let notify = self
            .waiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        LeaseWaiter {
            notify,
            _registration: Registration {
                notifier: self.clone(),
                key: key.to_string(),
            },
        }
    }

    fn wake(&self, key: &str) {
        if let Some(notify) = self.waiters.get(key) {
            notify.notify_waiters();
        }
    }

    /// Number of keys with at least one waiter.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// A waiter's handle on the `Notify` for one key.
///
/// Fields drop in order: the `Notify` handle first, then the registration,
/// so the last waiter to leave sees only the map's reference and removes it.
struct LeaseWaiter {
    notify: Arc<Notify>,
    _registration: Registration,
}

struct Registration {
    notifier: Arc<LeaseNotifier>,
    key: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.notifier
            .waiters
            .remove_if(&self.key, |_, n| Arc::strong_count(n) == 1);
    }
}

// =============================================================================
// Transactional Store
// =============================================================================

enum Probe<T> {
    Free(Entity<T>, Vec<u8>),
    Held,
}

/// Entity store with durable exclusive leases.
pub struct TransactionalStore<T> {
    entities: EntityStore<T>,
    notifier: Arc<LeaseNotifier>,
    settings: LeaseSettings,
}

impl<T> Clone for TransactionalStore<T> {
    fn clone(&self) -> Self {
        Self {
            entities: self.entities.clone(),
            notifier: self.notifier.clone(),
            settings: self.settings,
        }
    }
}

impl<T: RecordData> TransactionalStore<T> {
    pub fn new(
        entities: EntityStore<T>,
        notifier: Arc<LeaseNotifier>,
        settings: LeaseSettings,
    ) -> Self {
        Self {
            entities,
            notifier,
            settings,
        }
    }

    /// The plain entity store underneath.
    pub fn entities(&self) -> &EntityStore<T> {
        &self.entities
    }

    pub fn settings(&self) -> LeaseSettings {
        self.settings
    }

    /// Load a record once no lease is held on it.
    ///
    /// Always reads the durable store. Fails with [`CoreError::LockTimeout`]
    /// rather than returning a record that is mid-transaction.
    pub async fn get(&self, id: &str) -> Result<Entity<T>, CoreError> {
        let key = storage_key::<T>(id);
        let started = Instant::now();
        let deadline = started + self.settings.wait_timeout;
        let waiter = self.notifier.register(&key);

        loop {
            let notified = waiter.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.probe(&key).await? {
                Probe::Free(entity, raw) => {
                    self.entities.cache_raw(&key, raw);
                    return Ok(entity);
                }
                Probe::Held => self.wait(&key, started, deadline, notified).await?,
            }
        }
    }

    /// Take the lease on a record (the `Lock` operation).
    ///
    /// Waits while another holder has it, then sets `in_transaction` with a
    /// fresh `lease_token` and persists immediately. Fails with
    /// [`CoreError::RecordInactive`] for inactive records without taking the
    /// lease.
    pub async fn acquire(&self, id: &str) -> Result<Entity<T>, CoreError> {
        let key = storage_key::<T>(id);
        let started = Instant::now();
        let deadline = started + self.settings.wait_timeout;
        let waiter = self.notifier.register(&key);

        loop {
            let notified = waiter.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (mut entity, raw) = match self.probe(&key).await? {
                Probe::Free(entity, raw) => (entity, raw),
                Probe::Held => {
                    self.wait(&key, started, deadline, notified).await?;
                    continue;
                }
            };

            entity.ensure_active()?;
            if entity.in_transaction {
                warn!(
                    key = %key,
                    acquired_at = ?entity.lease_acquired_at,
                    "reclaiming abandoned lease"
                );
            }

            entity.set_lease(true);
            entity.touch();
            let leased = serde_json::to_vec(&entity)?;

            match self
                .entities
                .store()
                .compare_and_swap(&key, Some(&raw), Some(leased.clone()))
                .await
            {
                Ok(()) => {
                    self.entities.cache_raw(&key, leased);
                    debug!(key = %key, "lease acquired");
                    return Ok(entity);
                }
                // Someone else changed the record between our read and write.
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Give the lease back (the `Release` operation), persisting the holder's
    /// changes to the record.
    ///
    /// Fails with [`CoreError::LeaseLost`], writing nothing, if the lease
    /// expired and another acquirer reclaimed it in the meantime.
    pub async fn release(&self, entity: &mut Entity<T>) -> Result<(), CoreError> {
        let token = entity.lease_token;
        self.release_as(entity, token).await
    }

    /// Persist the holder's changes and keep the lease.
    pub async fn update(&self, entity: &mut Entity<T>) -> Result<(), CoreError> {
        entity.touch();
        let key = entity.key();
        let raw = serde_json::to_vec(entity)?;
        self.commit(&key, entity.lease_token, |_| Ok(Some(raw.clone())))
            .await
    }

    /// End the lease named by `token` and leave the stored record as it is.
    pub async fn release_unchanged(&self, id: &str, token: Option<Uuid>) -> Result<(), CoreError> {
        let key = storage_key::<T>(id);
        self.commit(&key, token, |mut stored| {
            stored.set_lease(false);
            stored.touch();
            Ok(Some(serde_json::to_vec(&stored)?))
        })
        .await?;
        self.notifier.wake(&key);
        debug!(key = %key, "lease released unchanged");
        Ok(())
    }

    /// Acquire the lease, run `f` with the record, and release on every path.
    ///
    /// On success the record returned by `f` is persisted with the lease
    /// cleared. On failure the stored record is released unchanged. If the
    /// returned future is dropped while `f` runs (a handler timeout), the
    /// lease is released unchanged in the background.
    pub async fn with_lease<R, F, Fut>(&self, id: &str, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(Entity<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<(Entity<T>, R)>>,
    {
        let entity = self.acquire(id).await?;
        let token = entity.lease_token;
        let mut guard = LeaseGuard {
            leases: self.clone(),
            id: id.to_string(),
            token,
            armed: true,
        };

        match f(entity).await {
            Ok((mut updated, value)) => {
                self.release_as(&mut updated, token).await?;
                guard.disarm();
                Ok(value)
            }
            Err(e) => {
                match self.release_unchanged(id, token).await {
                    Ok(()) => guard.disarm(),
                    Err(release_err) => {
                        warn!(id = %id, error = %release_err, "failed to release lease after error")
                    }
                }
                Err(e)
            }
        }
    }

    /// Clear a lease regardless of who holds it. Operator recovery path.
    pub async fn force_release(&self, id: &str) -> Result<Entity<T>, CoreError> {
        let key = storage_key::<T>(id);

        loop {
            let raw = self
                .entities
                .store()
                .get(&key)
                .await?
                .ok_or_else(|| CoreError::RecordNotFound { key: key.clone() })?;

            let mut entity: Entity<T> = serde_json::from_slice(&raw)?;
            if !entity.in_transaction {
                return Ok(entity);
            }

            entity.set_lease(false);
            entity.touch();
            let cleared = serde_json::to_vec(&entity)?;

            match self
                .entities
                .store()
                .compare_and_swap(&key, Some(&raw), Some(cleared.clone()))
                .await
            {
                Ok(()) => {
                    self.entities.cache_raw(&key, cleared);
                    self.notifier.wake(&key);
                    warn!(key = %key, "lease force-released");
                    return Ok(entity);
                }
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Delete a record. Deleting also ends any lease on it.
    pub async fn delete(&self, id: &str) -> Result<(), CoreError> {
        let key = storage_key::<T>(id);
        self.entities.delete(id).await?;
        self.notifier.wake(&key);
        Ok(())
    }

    /// Delete a record the caller holds the lease on, ending the lease.
    pub async fn delete_leased(&self, entity: &Entity<T>) -> Result<(), CoreError> {
        let key = entity.key();
        self.commit(&key, entity.lease_token, |_| Ok(None)).await?;
        self.notifier.wake(&key);
        debug!(key = %key, "leased record deleted");
        Ok(())
    }

    async fn release_as(&self, entity: &mut Entity<T>, token: Option<Uuid>) -> Result<(), CoreError> {
        entity.set_lease(false);
        entity.touch();
        let key = entity.key();
        let raw = serde_json::to_vec(entity)?;

        match self.commit(&key, token, |_| Ok(Some(raw.clone()))).await {
            Ok(()) => {
                self.notifier.wake(&key);
                debug!(key = %key, "lease released");
                Ok(())
            }
            Err(e) => {
                warn!(key = %key, error = %e, "lease release failed");
                Err(e)
            }
        }
    }

    /// Replace the stored record while `token` still names its lease.
    ///
    /// `next` maps the stored record to the bytes to write; `None` deletes.
    async fn commit<F>(&self, key: &str, token: Option<Uuid>, mut next: F) -> Result<(), CoreError>
    where
        F: FnMut(Entity<T>) -> Result<Option<Vec<u8>>, CoreError>,
    {
        loop {
            let raw = self
                .entities
                .store()
                .get(key)
                .await?
                .ok_or_else(|| CoreError::RecordNotFound {
                    key: key.to_string(),
                })?;

            let stored: Entity<T> = serde_json::from_slice(&raw)?;
            if !stored.is_leased_by(token) {
                return Err(CoreError::LeaseLost {
                    key: key.to_string(),
                });
            }

            let value = next(stored)?;
            match self
                .entities
                .store()
                .compare_and_swap(key, Some(&raw), value.clone())
                .await
            {
                Ok(()) => {
                    match value {
                        Some(v) => self.entities.cache_raw(key, v),
                        None => self.entities.evict_key(key),
                    }
                    return Ok(());
                }
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read the durable store and report whether the lease is free.
    async fn probe(&self, key: &str) -> Result<Probe<T>, CoreError> {
        let raw = self
            .entities
            .store()
            .get(key)
            .await?
            .ok_or_else(|| {
                self.entities.evict_key(key);
                CoreError::RecordNotFound {
                    key: key.to_string(),
                }
            })?;

        let entity: Entity<T> = serde_json::from_slice(&raw)?;
        if entity.lease_is_live(Utc::now(), self.settings.ttl) {
            Ok(Probe::Held)
        } else {
            Ok(Probe::Free(entity, raw))
        }
    }

    async fn wait(
        &self,
        key: &str,
        started: Instant,
        deadline: Instant,
        notified: std::pin::Pin<&mut tokio::sync::futures::Notified<'_>>,
    ) -> Result<(), CoreError> {
        let now = Instant::now();
        if now >= deadline {
            return Err(CoreError::LockTimeout {
                key: key.to_string(),
                waited: now - started,
            });
        }

        let nap = self.settings.poll_interval.min(deadline - now);
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(nap) => {}
        }
        Ok(())
    }
}

// =============================================================================
// Lease Guard
// =============================================================================

/// Releases a `with_lease` lease in the background when the holding future
/// is dropped before it could release.
struct LeaseGuard<T: RecordData> {
    leases: TransactionalStore<T>,
    id: String,
    token: Option<Uuid>,
    armed: bool,
}

impl<T: RecordData> LeaseGuard<T> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T: RecordData> Drop for LeaseGuard<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(id = %self.id, "lease holder dropped outside a runtime, lease left to expire");
            return;
        };

        let leases = self.leases.clone();
        let id = std::mem::take(&mut self.id);
        let token = self.token;
        runtime.spawn(async move {
            match leases.release_unchanged(&id, token).await {
                Ok(()) => warn!(id = %id, "lease released after its holder was dropped"),
                // Already released, or reclaimed after expiry.
                Err(CoreError::LeaseLost { .. }) => {}
                Err(e) => warn!(id = %id, error = %e, "failed to release lease of dropped holder"),
            }
        });
    }
}
