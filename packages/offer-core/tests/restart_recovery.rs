//! Integration tests for pending settlement events across restarts.
//!
//! Pending events are written to the sled store. After the process restarts,
//! a late confirmation must find its event and complete it exactly once, and
//! leases left behind by a crash must be recoverable.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use offer_core::{
    async_trait, CoreConfig, CoreError, CoreServices, DispatchOutcome, Disposition, Entity,
    SettlementCallback, SettlementEvent,
};

use crate::common::{fast_config, init_tracing, temp_store_path, Faucet, Kind};

struct CreditFaucet {
    services: CoreServices,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl SettlementCallback<Kind> for CreditFaucet {
    async fn settle(&self, event: &mut Entity<SettlementEvent<Kind>>) -> anyhow::Result<Disposition> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let amount = event.data.amount;
        self.services
            .transactional::<Faucet>()
            .with_lease(&event.data.payee, |mut faucet| async move {
                faucet.data.remaining += amount;
                Ok((faucet, ()))
            })
            .await?;
        Ok(Disposition::Inactivate)
    }
}

fn top_up(amount: u64) -> SettlementEvent<Kind> {
    SettlementEvent::new(Kind::FaucetTopUp, "owner", "x", amount).with_memo("top-up")
}

async fn seed_faucet(services: &CoreServices) {
    let mut faucet = Entity::new(
        "x",
        Faucet {
            owner: "owner".into(),
            remaining: 0,
            per_user: 20,
        },
    );
    services
        .entities::<Faucet>()
        .create(&mut faucet)
        .await
        .expect("Failed to create faucet");
}

fn cleanup(config: CoreConfig) {
    let _ = std::fs::remove_dir_all(config.store_path);
}

// =============================================================================
// Restart Recovery
// =============================================================================

#[tokio::test]
async fn pending_events_survive_restart_and_settle_once() {
    init_tracing();
    let config = fast_config(temp_store_path());

    // Arrange: first process creates pending invoices, then stops
    {
        let services = CoreServices::open(config.clone()).unwrap();
        seed_faucet(&services).await;
        let dispatcher = services.dispatcher::<Kind>();
        for (hash, amount) in [("hash:1", 30), ("hash:2", 50), ("hash:3", 20)] {
            dispatcher.create_pending(hash, top_up(amount)).await.unwrap();
        }
        services.shutdown().await.unwrap();
    }

    // Act: second process registers callbacks and receives confirmations
    let services = CoreServices::open(config.clone()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut dispatcher = services.dispatcher::<Kind>();
    dispatcher.register_callback(
        Kind::FaucetTopUp,
        CreditFaucet {
            services: services.clone(),
            calls: calls.clone(),
        },
    );

    let pending = dispatcher.pending().await.unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|e| e.data.memo == "top-up"));

    for event in &pending {
        let outcome = dispatcher.dispatch(&event.id).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Settled(Disposition::Inactivate));
    }

    // Assert
    assert!(dispatcher.pending().await.unwrap().is_empty());
    assert_eq!(
        dispatcher.dispatch("hash:2").await.unwrap(),
        DispatchOutcome::AlreadySettled
    );
    assert_eq!(
        dispatcher.dispatch("hash:elsewhere").await.unwrap(),
        DispatchOutcome::Unknown
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let faucet = services.transactional::<Faucet>().get("x").await.unwrap();
    assert_eq!(faucet.data.remaining, 100);

    drop(dispatcher);
    drop(services);
    cleanup(config);
}

#[tokio::test]
async fn crashed_lease_blocks_until_force_release() {
    init_tracing();
    let config = CoreConfig {
        lease_wait_timeout: Duration::from_millis(100),
        ..fast_config(temp_store_path())
    };

    // Arrange: the first process takes the event's lease and dies holding it
    {
        let services = CoreServices::open(config.clone()).unwrap();
        seed_faucet(&services).await;
        let dispatcher = services.dispatcher::<Kind>();
        dispatcher.create_pending("hash:1", top_up(10)).await.unwrap();
        let _held = dispatcher.events().acquire("hash:1").await.unwrap();
        services.store().flush().await.unwrap();
    }

    let services = CoreServices::open(config.clone()).unwrap();
    let mut dispatcher = services.dispatcher::<Kind>();
    dispatcher.register_callback(
        Kind::FaucetTopUp,
        CreditFaucet {
            services: services.clone(),
            calls: Arc::new(AtomicUsize::new(0)),
        },
    );

    // Act + Assert: with no lease expiry the confirmation times out
    let err = dispatcher.dispatch("hash:1").await.unwrap_err();
    assert!(matches!(err, CoreError::LockTimeout { .. }));
    assert!(err.is_retryable());

    // The operator clears the lease and the redelivered confirmation settles
    dispatcher.events().force_release("hash:1").await.unwrap();
    assert_eq!(
        dispatcher.dispatch("hash:1").await.unwrap(),
        DispatchOutcome::Settled(Disposition::Inactivate)
    );

    drop(dispatcher);
    drop(services);
    cleanup(config);
}

#[tokio::test]
async fn crashed_lease_expires_with_ttl() {
    init_tracing();
    let config = CoreConfig {
        lease_ttl: Some(Duration::from_millis(200)),
        ..fast_config(temp_store_path())
    };

    // Arrange
    {
        let services = CoreServices::open(config.clone()).unwrap();
        seed_faucet(&services).await;
        let dispatcher = services.dispatcher::<Kind>();
        dispatcher.create_pending("hash:1", top_up(10)).await.unwrap();
        let _held = dispatcher.events().acquire("hash:1").await.unwrap();
        services.store().flush().await.unwrap();
    }

    let services = CoreServices::open(config.clone()).unwrap();
    let mut dispatcher = services.dispatcher::<Kind>();
    dispatcher.register_callback(
        Kind::FaucetTopUp,
        CreditFaucet {
            services: services.clone(),
            calls: Arc::new(AtomicUsize::new(0)),
        },
    );

    // Act: the waiter polls until the abandoned lease passes its TTL
    let outcome = dispatcher.dispatch("hash:1").await.unwrap();

    // Assert
    assert_eq!(outcome, DispatchOutcome::Settled(Disposition::Inactivate));
    let faucet = services.transactional::<Faucet>().get("x").await.unwrap();
    assert_eq!(faucet.data.remaining, 10);

    drop(dispatcher);
    drop(services);
    cleanup(config);
}
