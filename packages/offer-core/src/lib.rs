//! # Offer Core
//!
//! Concurrency control and durable transactions for chat-driven value
//! transfer: sends, tip jars, faucets and shops that many users can interact
//! with at once, over a transport that may deliver the same button press
//! twice.
//!
//! ## Guarantees
//!
//! 1. **One mutation at a time.** A record is mutated by at most one holder of
//!    its lease. The lease is a flag persisted in the durable store, so it is
//!    respected by every process sharing that store. Only the current holder's
//!    token can release it; a holder whose expired lease was reclaimed writes
//!    nothing.
//! 2. **Once per actor.** An actor consumes a given offer at most once, even
//!    under duplicate delivery.
//! 3. **Pending work survives restarts.** Settlement events are durable; a
//!    confirmation arriving after a restart finds its record and completes it.
//!    A settlement whose result could not be recorded is never run twice.
//!
//! ## Architecture
//!
//! ```text
//! Transport (chat updates)                      Wallet (settlement confirmations)
//!     │                                                  │
//!     ▼ TriggerRouter::route()                           ▼ EventDispatcher::dispatch()
//! InterceptorChain                                  acquire event lease
//!     │                                                  │
//!     ├─► AcquireActorLock   (MutexManager)              ├─► SettlementCallback[kind]
//!     ├─► before steps       (LoadRecord, LogTrigger)    │        │
//!     ├─► handler ──────────► OnceGuard::once()          │        ▼
//!     │                       TransactionalStore ◄───────┼── Disposition applied
//!     ├─► after steps              │                     │
//!     └─► defer + ReleaseActorLock ▼                     └─► release lease
//!                            EntityStore ──► RecordCache (TTL)
//!                                  │
//!                                  ▼
//!                            DurableStore (sled / memory)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use offer_core::{CoreConfig, CoreServices, Entity, RecordData, Trigger};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Faucet { remaining: u64, per_user: u64 }
//! impl RecordData for Faucet { const NAMESPACE: &'static str = "faucet"; }
//!
//! struct Claim { faucets: TransactionalStore<Faucet>, once: OnceGuard }
//!
//! #[async_trait]
//! impl TriggerHandler for Claim {
//!     async fn handle(&self, ctx: &mut TriggerContext) -> anyhow::Result<()> {
//!         let id = ctx.trigger().data.clone();
//!         let actor = ctx.trigger().actor.clone();
//!         self.faucets
//!             .with_lease(&id, |mut faucet| async move {
//!                 anyhow::ensure!(faucet.data.remaining >= faucet.data.per_user, "faucet empty");
//!                 self.once.once(&id, &actor)?;
//!                 faucet.data.remaining -= faucet.data.per_user;
//!                 Ok((faucet, ()))
//!             })
//!             .await
//!     }
//! }
//!
//! let services = CoreServices::open(CoreConfig::from_env()?)?;
//! let mut router = TriggerRouter::new();
//! router.register("faucet_claim", services.chain().before(LogTrigger).build(Claim { .. }));
//! router.route(Trigger::button("42", "faucet_claim", "faucet:x"), services.shutdown_token()).await?;
//! ```
//!
//! ## What This Does NOT Do
//!
//! - Move money. Wallet calls happen in handlers and callbacks.
//! - Parse commands or render text. Errors carry an [`ErrorCategory`] for the
//!   presentation layer to localize.
//! - Coordinate independent stores. Cross-process exclusion holds only among
//!   processes sharing one [`DurableStore`].

mod cache;
mod config;
mod dispatch;
mod entity;
mod error;
mod intercept;
mod lease;
mod mutex;
mod once;
mod record;
mod services;
mod sled_store;
mod store;
mod ticker;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export error types
pub use crate::error::{core_error, CoreError, ErrorCategory};

// Re-export configuration
pub use config::CoreConfig;

// Re-export lock types
pub use mutex::{FlowId, KeyGuard, MutexManager};
pub use once::OnceGuard;

// Re-export record and persistence types
pub use cache::{RecordCache, TtlCache};
pub use entity::{is_conflict, EntityStore};
pub use lease::{LeaseNotifier, LeaseSettings, TransactionalStore};
pub use record::{storage_key, Entity, RecordData};
pub use sled_store::SledStore;
pub use store::{DurableStore, MemoryStore, StoreError};

// Re-export settlement types
pub use dispatch::{
    Disposition, DispatchOutcome, EventDispatcher, EventKind, SettlementCallback,
    SettlementEvent,
};

// Re-export trigger pipeline types
pub use intercept::{
    AcquireActorLock, ChainBuilder, Interceptor, InterceptorChain, LoadRecord, LogTrigger,
    ReleaseActorLock, Trigger, TriggerContext, TriggerHandler, TriggerKind, TriggerRouter,
};

// Re-export polling types
pub use ticker::{RetryTicker, TickerOutcome};

// Re-export the service bundle
pub use services::CoreServices;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
