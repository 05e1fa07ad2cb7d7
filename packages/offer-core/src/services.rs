//! The shared service bundle an application builds once at startup.
//!
//! Everything the core needs is constructed here and passed explicitly to
//! handlers: one mutex manager, one once guard, one durable store, one cache.
//! Nothing lives in a global, so tests construct as many independent bundles
//! as they like.
//!
//! ```ignore
//! let services = CoreServices::open(CoreConfig::from_env()?)?;
//! let _janitor = services.spawn_cache_janitor(Duration::from_secs(60));
//!
//! let faucets = services.transactional::<Faucet>();
//! let mut router = TriggerRouter::new();
//! router.register("faucet_claim", services.chain().before(LogTrigger).build(Claim::new(faucets, services.once().clone())));
//!
//! // ... serve triggers ...
//!
//! services.shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::TtlCache;
use crate::config::CoreConfig;
use crate::dispatch::{EventDispatcher, EventKind};
use crate::entity::EntityStore;
use crate::error::CoreError;
use crate::intercept::{ChainBuilder, InterceptorChain};
use crate::lease::{LeaseNotifier, TransactionalStore};
use crate::mutex::MutexManager;
use crate::once::OnceGuard;
use crate::record::RecordData;
use crate::sled_store::SledStore;
use crate::store::{DurableStore, MemoryStore};

/// Explicitly initialized core services. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CoreServices {
    config: CoreConfig,
    store: Arc<dyn DurableStore>,
    cache: Arc<TtlCache>,
    mutexes: MutexManager,
    once: OnceGuard,
    notifier: Arc<LeaseNotifier>,
    shutdown: CancellationToken,
}

impl CoreServices {
    /// Open the sled store at `config.store_path`.
    pub fn open(config: CoreConfig) -> Result<Self, CoreError> {
        let store = SledStore::open(&config.store_path)?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Services over an in-process store. Nothing survives a restart.
    pub fn in_memory(config: CoreConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(config: CoreConfig, store: Arc<dyn DurableStore>) -> Self {
        Self {
            config,
            store,
            cache: Arc::new(TtlCache::new()),
            mutexes: MutexManager::new(),
            once: OnceGuard::new(),
            notifier: Arc::new(LeaseNotifier::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    pub fn mutexes(&self) -> &MutexManager {
        &self.mutexes
    }

    pub fn once(&self) -> &OnceGuard {
        &self.once
    }

    /// Process-wide shutdown token. Pass it as the parent of every trigger.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn entities<T: RecordData>(&self) -> EntityStore<T> {
        EntityStore::new(self.store.clone(), self.cache.clone(), self.config.cache_ttl)
    }

    /// Lease-aware store for `T`, sharing wake-ups with every other one built here.
    pub fn transactional<T: RecordData>(&self) -> TransactionalStore<T> {
        TransactionalStore::new(
            self.entities(),
            self.notifier.clone(),
            self.config.lease_settings(),
        )
    }

    pub fn dispatcher<K: EventKind>(&self) -> EventDispatcher<K> {
        EventDispatcher::new(self.transactional())
    }

    /// Chain builder using the shared mutex manager and the configured timeout.
    pub fn chain(&self) -> ChainBuilder {
        InterceptorChain::builder(self.mutexes.clone()).timeout(self.config.handler_timeout)
    }

    /// Periodically drop expired cache entries until shutdown.
    pub fn spawn_cache_janitor(&self, every: Duration) -> JoinHandle<()> {
        let cache = self.cache.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, "purged expired cache entries");
                        }
                    }
                }
            }
        })
    }

    /// Cancel in-flight triggers, drop process-local state and flush the store.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        info!("shutting down offer core");
        self.shutdown.cancel();
        self.once.clear();
        self.cache.clear();
        self.store.flush().await?;
        Ok(())
    }
}

impl std::fmt::Debug for CoreServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreServices")
            .field("config", &self.config)
            .field("locks", &self.mutexes.len())
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}
