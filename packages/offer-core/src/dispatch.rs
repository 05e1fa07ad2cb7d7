//! Settlement event dispatcher.
//!
//! # Overview
//!
//! When an invoice is created for an offer, the application persists a
//! *pending event* keyed by the wallet's correlation key (for example a
//! payment hash). Later, possibly after a restart, the wallet reports that the
//! payment settled and the receiver calls [`EventDispatcher::dispatch`] with
//! that key. The dispatcher:
//!
//! 1. Takes the lease on the pending event (so concurrent confirmations of the
//!    same payment serialize).
//! 2. Looks up the callback registered for the event's `kind`.
//! 3. Runs it, and applies the [`Disposition`] it returns.
//!
//! ```text
//! settlement(key) ──► acquire lease ──► callback[kind].settle(&mut event)
//!                          │                       │
//!                   absent │ inactive              ├─ Inactivate → persist inactive
//!                          ▼                       ├─ Delete     → remove record
//!                Unknown / AlreadySettled          └─ Retain     → persist, stay pending
//! ```
//!
//! # The Contract
//!
//! - An unknown key is not an error: notifications for other services share
//!   the same wallet. It is logged at debug and reported as
//!   [`DispatchOutcome::Unknown`].
//! - An inactive event was already settled. A redelivered confirmation is
//!   reported as [`DispatchOutcome::AlreadySettled`] and the callback is not
//!   invoked again.
//! - A callback error or panic is logged and surfaced as
//!   [`CoreError::CallbackFailed`]. The event is released unchanged and stays
//!   pending; there is no automatic retry.
//! - The event is marked `settling_since` in the store before its callback
//!   runs, and the mark is cleared in the same write that records the
//!   disposition. A confirmation that finds the mark still set gets
//!   [`CoreError::SettlementInDoubt`] and the callback does not run again.
//!   [`EventDispatcher::resolve_in_doubt`] is the operator path.
//! - The lease is released on every path the store allows.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{panic_message, CoreError};
use crate::lease::TransactionalStore;
use crate::record::{Entity, RecordData};

// =============================================================================
// Event Model
// =============================================================================

/// The closed set of settlement kinds an application handles.
///
/// Implemented automatically for any enum with the listed derives:
///
/// ```ignore
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// enum Kind {
///     SendInvoice,
///     TipjarInvoice,
///     ShopInvoice,
/// }
/// ```
pub trait EventKind:
    Serialize + DeserializeOwned + Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static
{
}

impl<T> EventKind for T where
    T: Serialize + DeserializeOwned + Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static
{
}

/// A pending settlement, persisted until its confirmation arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementEvent<K> {
    pub kind: K,
    pub payer: String,
    pub payee: String,
    pub amount: u64,
    /// Opaque data the callback needs to finish the offer (offer id, message ids).
    #[serde(default)]
    pub callback_data: serde_json::Value,
    #[serde(default)]
    pub memo: String,
    /// Set while the callback runs. Still set on a later dispatch, it means
    /// an earlier callback may have taken effect without being recorded.
    #[serde(default)]
    pub settling_since: Option<DateTime<Utc>>,
}

impl<K: EventKind> SettlementEvent<K> {
    pub fn new(kind: K, payer: impl Into<String>, payee: impl Into<String>, amount: u64) -> Self {
        Self {
            kind,
            payer: payer.into(),
            payee: payee.into(),
            amount,
            callback_data: serde_json::Value::Null,
            memo: String::new(),
            settling_since: None,
        }
    }

    pub fn with_callback_data(mut self, data: serde_json::Value) -> Self {
        self.callback_data = data;
        self
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = memo.into();
        self
    }
}

impl<K: EventKind> RecordData for SettlementEvent<K> {
    const NAMESPACE: &'static str = "event";
}

/// What the dispatcher does with the event after a successful callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Mark the event inactive and keep it (the usual case).
    Inactivate,
    /// Remove the event record entirely.
    Delete,
    /// Persist the callback's changes and leave the event pending.
    Retain,
}

/// Result of a [`EventDispatcher::dispatch`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The callback ran and its disposition was applied.
    Settled(Disposition),
    /// No pending event under this key.
    Unknown,
    /// The event was already settled; nothing ran.
    AlreadySettled,
}

/// Completes an offer when its settlement confirmation arrives.
///
/// The callback runs while the event's lease is held. Mutations it makes to
/// `event` are persisted unless it fails.
#[async_trait]
pub trait SettlementCallback<K: EventKind>: Send + Sync + 'static {
    async fn settle(&self, event: &mut Entity<SettlementEvent<K>>) -> anyhow::Result<Disposition>;
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Routes settlement confirmations to the callback registered for their kind.
pub struct EventDispatcher<K: EventKind> {
    events: TransactionalStore<SettlementEvent<K>>,
    callbacks: HashMap<K, Arc<dyn SettlementCallback<K>>>,
}

impl<K: EventKind> EventDispatcher<K> {
    pub fn new(events: TransactionalStore<SettlementEvent<K>>) -> Self {
        Self {
            events,
            callbacks: HashMap::new(),
        }
    }

    /// Register the callback for `kind`.
    ///
    /// # Panics
    ///
    /// Panics if a callback is already registered for this kind. Use
    /// [`try_register_callback`](Self::try_register_callback) for a
    /// non-panicking version.
    pub fn register_callback<C>(&mut self, kind: K, callback: C)
    where
        C: SettlementCallback<K>,
    {
        if let Err(e) = self.try_register_callback(kind, callback) {
            panic!("{}", e);
        }
    }

    /// Register the callback for `kind`, failing with
    /// [`CoreError::CallbackAlreadyRegistered`] on a duplicate.
    pub fn try_register_callback<C>(&mut self, kind: K, callback: C) -> Result<(), CoreError>
    where
        C: SettlementCallback<K>,
    {
        if self.callbacks.contains_key(&kind) {
            return Err(CoreError::CallbackAlreadyRegistered {
                kind: format!("{:?}", kind),
            });
        }
        self.callbacks.insert(kind, Arc::new(callback));
        Ok(())
    }

    /// Persist a pending event under `correlation_key`.
    ///
    /// Fails with a store conflict if an event with that key already exists.
    pub async fn create_pending(
        &self,
        correlation_key: &str,
        event: SettlementEvent<K>,
    ) -> Result<Entity<SettlementEvent<K>>, CoreError> {
        let kind = event.kind;
        let mut record = Entity::new(correlation_key, event);
        self.events.entities().create(&mut record).await?;
        info!(key = %correlation_key, kind = ?kind, amount = record.data.amount, "pending event created");
        Ok(record)
    }

    /// Every event still awaiting settlement, read from the durable store.
    ///
    /// Used after a restart to re-subscribe to the wallet for each one.
    pub async fn pending(&self) -> Result<Vec<Entity<SettlementEvent<K>>>, CoreError> {
        self.events.entities().list_active().await
    }

    /// The lease-aware store holding the events.
    pub fn events(&self) -> &TransactionalStore<SettlementEvent<K>> {
        &self.events
    }

    /// Handle a settlement confirmation for `correlation_key`.
    pub async fn dispatch(&self, correlation_key: &str) -> Result<DispatchOutcome, CoreError> {
        let mut event = match self.events.acquire(correlation_key).await {
            Ok(event) => event,
            Err(CoreError::RecordNotFound { .. }) => {
                debug!(key = %correlation_key, "settlement for unknown event dropped");
                return Ok(DispatchOutcome::Unknown);
            }
            Err(CoreError::RecordInactive { .. }) => {
                debug!(key = %correlation_key, "event already settled");
                return Ok(DispatchOutcome::AlreadySettled);
            }
            Err(e) => return Err(e),
        };

        if let Some(since) = event.data.settling_since {
            error!(key = %correlation_key, %since, "earlier settlement was never recorded");
            self.release_unchanged(&event).await;
            return Err(CoreError::SettlementInDoubt {
                key: correlation_key.to_string(),
            });
        }

        let kind = event.data.kind;
        let Some(callback) = self.callbacks.get(&kind).cloned() else {
            error!(key = %correlation_key, kind = ?kind, "no settlement callback registered");
            self.release_unchanged(&event).await;
            return Err(CoreError::CallbackNotRegistered {
                kind: format!("{:?}", kind),
            });
        };

        let original = event.clone();
        event.data.settling_since = Some(Utc::now());
        if let Err(e) = self.events.update(&mut event).await {
            warn!(key = %correlation_key, error = %e, "could not mark event settling");
            self.release_unchanged(&original).await;
            return Err(e);
        }

        let result = AssertUnwindSafe(callback.settle(&mut event))
            .catch_unwind()
            .await;

        let failure = match result {
            Ok(Ok(disposition)) => {
                event.data.settling_since = None;
                if let Err(e) = self.apply(&mut event, disposition).await {
                    error!(
                        key = %correlation_key,
                        kind = ?kind,
                        ?disposition,
                        error = %e,
                        "callback ran but its result was not recorded"
                    );
                    // The stored mark stays set; only the lease is given back.
                    self.release_unchanged(&event).await;
                    return Err(e);
                }
                info!(key = %correlation_key, kind = ?kind, ?disposition, "event settled");
                return Ok(DispatchOutcome::Settled(disposition));
            }
            Ok(Err(e)) => e,
            Err(panic) => {
                let msg = panic_message(&*panic);
                anyhow::anyhow!("callback panicked: {}", msg)
            }
        };

        error!(key = %correlation_key, kind = ?kind, error = %failure, "settlement callback failed");
        let mut original = original;
        if let Err(e) = self.events.release(&mut original).await {
            warn!(key = %correlation_key, error = %e, "failed to release event lease");
        }
        Err(CoreError::CallbackFailed {
            kind: format!("{:?}", kind),
            source: failure,
        })
    }

    /// Close out an in-doubt event after an operator has checked whether its
    /// callback took effect.
    ///
    /// `settled = true` marks it inactive. `settled = false` clears the mark
    /// so the next confirmation runs the callback again.
    pub async fn resolve_in_doubt(&self, correlation_key: &str, settled: bool) -> Result<(), CoreError> {
        let mut event = self.events.acquire(correlation_key).await?;
        event.data.settling_since = None;
        if settled {
            event.active = false;
        }
        self.events.release(&mut event).await?;
        warn!(key = %correlation_key, settled, "in-doubt settlement resolved");
        Ok(())
    }

    async fn apply(
        &self,
        event: &mut Entity<SettlementEvent<K>>,
        disposition: Disposition,
    ) -> Result<(), CoreError> {
        match disposition {
            Disposition::Inactivate => {
                event.active = false;
                self.events.release(event).await
            }
            Disposition::Retain => self.events.release(event).await,
            Disposition::Delete => self.events.delete_leased(event).await,
        }
    }

    async fn release_unchanged(&self, event: &Entity<SettlementEvent<K>>) {
        if let Err(e) = self.events.release_unchanged(&event.id, event.lease_token).await {
            warn!(key = %event.id, error = %e, "failed to release event lease");
        }
    }
}

impl<K: EventKind> fmt::Debug for EventDispatcher<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("kinds", &self.callbacks.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
