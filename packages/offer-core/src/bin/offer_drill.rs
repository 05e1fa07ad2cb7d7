// Operator drill: exercises the offer core against the configured store

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use offer_core::{
    async_trait, core_error, CoreConfig, CoreError, CoreServices, DispatchOutcome, Disposition,
    Entity, LogTrigger, OnceGuard, RecordData, RetryTicker, SettlementCallback, SettlementEvent,
    TransactionalStore, Trigger, TriggerContext, TriggerHandler, TriggerRouter,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Faucet {
    remaining: u64,
    per_user: u64,
}

impl RecordData for Faucet {
    const NAMESPACE: &'static str = "faucet";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum DrillKind {
    FaucetTopUp,
}

struct Claim {
    faucets: TransactionalStore<Faucet>,
    once: OnceGuard,
}

#[async_trait]
impl TriggerHandler for Claim {
    async fn handle(&self, ctx: &mut TriggerContext) -> Result<()> {
        let id = ctx.trigger().data.clone();
        let actor = ctx.trigger().actor.clone();
        let once = self.once.clone();

        let amount = self
            .faucets
            .with_lease(&id, |mut faucet| async move {
                if faucet.data.remaining < faucet.data.per_user {
                    return Err(anyhow::anyhow!("faucet {} is empty", faucet.id));
                }
                once.once(&faucet.id, &actor)?;
                faucet.data.remaining -= faucet.data.per_user;
                let amount = faucet.data.per_user;
                Ok((faucet, amount))
            })
            .await?;

        info!(faucet = %id, actor = %ctx.trigger().actor, amount, "faucet claimed");
        Ok(())
    }
}

struct TopUp {
    faucets: TransactionalStore<Faucet>,
}

#[async_trait]
impl SettlementCallback<DrillKind> for TopUp {
    async fn settle(&self, event: &mut Entity<SettlementEvent<DrillKind>>) -> Result<Disposition> {
        let faucet_id = event
            .data
            .callback_data
            .get("faucet")
            .and_then(|v| v.as_str())
            .context("top-up event without faucet id")?
            .to_string();
        let amount = event.data.amount;

        self.faucets
            .with_lease(&faucet_id, |mut faucet| async move {
                faucet.data.remaining += amount;
                Ok((faucet, ()))
            })
            .await?;
        Ok(Disposition::Inactivate)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,offer_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = CoreConfig::from_env().context("Failed to load configuration")?;
    info!(store = %config.store_path.display(), "Configuration loaded");

    let services = CoreServices::open(config).context("Failed to open record store")?;
    let _janitor = services.spawn_cache_janitor(Duration::from_secs(60));

    let mut args = std::env::args().skip(1);
    let result = match args.next().as_deref() {
        None | Some("faucet") => faucet_drill(&services).await,
        Some("pending") => list_pending(&services).await,
        Some("release") => {
            let id = args.next().context("usage: offer-drill release <faucet-id>")?;
            let faucet = services.transactional::<Faucet>().force_release(&id).await?;
            info!(faucet = %faucet.id, remaining = faucet.data.remaining, "lease cleared");
            Ok(())
        }
        Some("resolve") => resolve(&services, args.next(), args.next()).await,
        Some(other) => Err(anyhow::anyhow!(
            "unknown drill {:?} (expected faucet, pending, release or resolve)",
            other
        )),
    };

    services.shutdown().await.context("Failed to flush record store")?;
    result
}

async fn faucet_drill(services: &CoreServices) -> Result<()> {
    let faucets = services.transactional::<Faucet>();
    let faucet_id = format!("faucet:{}", Uuid::new_v4());
    let mut faucet = Entity::new(
        faucet_id.clone(),
        Faucet {
            remaining: 100,
            per_user: 20,
        },
    );
    faucets.entities().create(&mut faucet).await?;
    info!(faucet = %faucet_id, "faucet created with 100");

    let mut router = TriggerRouter::new();
    router.register(
        "faucet_claim",
        services.chain().before(LogTrigger).build(Claim {
            faucets: faucets.clone(),
            once: services.once().clone(),
        }),
    );
    let router = Arc::new(router);

    // Six actors, each delivering their button press twice.
    let mut handles = Vec::new();
    for actor in 1..=6 {
        for delivery in 0..2 {
            let router = router.clone();
            let shutdown = services.shutdown_token().clone();
            let trigger = Trigger::button(actor.to_string(), "faucet_claim", faucet_id.clone())
                .with_delivery_id(format!("{}-{}", actor, delivery));
            handles.push(tokio::spawn(async move { router.route(trigger, &shutdown).await }));
        }
    }

    let mut claimed = 0;
    for handle in handles {
        match handle.await? {
            Ok(()) => claimed += 1,
            Err(e) => match core_error(&e) {
                Some(CoreError::AlreadyConsumed { .. }) => {}
                _ => warn!(error = %e, "claim refused"),
            },
        }
    }

    let after_claims = faucets.get(&faucet_id).await?;
    info!(claimed, remaining = after_claims.data.remaining, "claims finished");

    // Top the faucet up through a settlement confirmed by a polled wallet.
    let mut dispatcher = services.dispatcher::<DrillKind>();
    dispatcher.register_callback(DrillKind::FaucetTopUp, TopUp { faucets: faucets.clone() });
    let payment_hash = format!("hash:{}", Uuid::new_v4());
    dispatcher
        .create_pending(
            &payment_hash,
            SettlementEvent::new(DrillKind::FaucetTopUp, "operator", "faucet", 40)
                .with_callback_data(serde_json::json!({ "faucet": faucet_id }))
                .with_memo("drill top-up"),
        )
        .await?;

    let polls = AtomicUsize::new(0);
    let ticker = RetryTicker::new(
        payment_hash.clone(),
        Duration::from_millis(200),
        Duration::from_secs(10),
        services.shutdown_token(),
    );
    let outcome = ticker
        .run(
            |token| {
                // The simulated wallet reports payment on the third poll.
                let paid = polls.fetch_add(1, Ordering::SeqCst) + 1 >= 3;
                async move {
                    if paid {
                        token.cancel();
                    }
                }
            },
            || info!(key = %payment_hash, "payment observed"),
            || warn!(key = %payment_hash, "payment never arrived"),
        )
        .await;
    info!(?outcome, polls = polls.load(Ordering::SeqCst), "wallet polling finished");

    match dispatcher.dispatch(&payment_hash).await? {
        DispatchOutcome::Settled(disposition) => info!(?disposition, "top-up settled"),
        other => warn!(?other, "top-up not settled"),
    }
    // A redelivered confirmation is a no-op.
    let again = dispatcher.dispatch(&payment_hash).await?;
    info!(?again, "redelivered confirmation");

    let finished = faucets.get(&faucet_id).await?;
    info!(faucet = %faucet_id, remaining = finished.data.remaining, "drill complete");
    Ok(())
}

async fn resolve(services: &CoreServices, key: Option<String>, verdict: Option<String>) -> Result<()> {
    let usage = "usage: offer-drill resolve <event-key> settled|retry";
    let key = key.context(usage)?;
    let settled = match verdict.as_deref() {
        Some("settled") => true,
        Some("retry") => false,
        _ => anyhow::bail!(usage),
    };
    services
        .dispatcher::<DrillKind>()
        .resolve_in_doubt(&key, settled)
        .await?;
    info!(key = %key, settled, "event resolved");
    Ok(())
}

async fn list_pending(services: &CoreServices) -> Result<()> {
    let dispatcher = services.dispatcher::<DrillKind>();
    let pending = dispatcher.pending().await?;
    info!(count = pending.len(), "pending events");
    for event in pending {
        info!(
            key = %event.id,
            kind = ?event.data.kind,
            amount = event.data.amount,
            leased = event.in_transaction,
            in_doubt = event.data.settling_since.is_some(),
            created_at = %event.created_at,
            "pending"
        );
    }
    Ok(())
}
