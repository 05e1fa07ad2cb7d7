//! Deadline-bound polling of an external system.
//!
//! A [`RetryTicker`] runs a probe on every tick until one of three things
//! happens, whichever comes first:
//!
//! ```text
//! tick → probe() ──► probe cancels the ticker token ──► on_cancel   (Succeeded)
//!   │                parent token cancelled        ──► on_cancel   (Cancelled)
//!   └──────────────► deadline elapses              ──► on_deadline (DeadlineExceeded)
//! ```
//!
//! Exactly one of `on_cancel` / `on_deadline` fires, and no probe runs after
//! it. The deadline always fires eventually if cancellation never does: a
//! probe still running at the deadline or at cancellation is dropped.
//!
//! # Example
//!
//! ```ignore
//! let ticker = RetryTicker::new(
//!     format!("invoice:{}", payment_hash),
//!     Duration::from_secs(5),
//!     Duration::from_secs(600),
//!     &shutdown,
//! );
//!
//! let outcome = ticker
//!     .run(
//!         |token| {
//!             let wallet = wallet.clone();
//!             async move {
//!                 if wallet.is_paid(&payment_hash).await.unwrap_or(false) {
//!                     token.cancel();
//!                 }
//!             }
//!         },
//!         || dispatcher_hint(),
//!         || tracing::info!("invoice expired"),
//!     )
//!     .await;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a [`RetryTicker`] run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerOutcome {
    /// The probe cancelled the ticker's token.
    Succeeded,
    /// The parent token was cancelled from outside.
    Cancelled,
    /// The deadline elapsed first.
    DeadlineExceeded,
}

/// A polling loop bound to a cancellable, deadline-capable context.
pub struct RetryTicker {
    key: String,
    interval: Duration,
    deadline: Instant,
    parent: CancellationToken,
    token: CancellationToken,
}

impl RetryTicker {
    /// Create a ticker that gives up `timeout` from now.
    pub fn new(
        key: impl Into<String>,
        interval: Duration,
        timeout: Duration,
        parent: &CancellationToken,
    ) -> Self {
        Self::with_deadline(key, interval, Instant::now() + timeout, parent)
    }

    /// Create a ticker with an absolute deadline.
    pub fn with_deadline(
        key: impl Into<String>,
        interval: Duration,
        deadline: Instant,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            key: key.into(),
            interval,
            deadline,
            parent: parent.clone(),
            token: parent.child_token(),
        }
    }

    /// The token a probe cancels to signal success.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Probe on every tick until cancellation or the deadline.
    pub async fn run<P, PF, C, D>(self, mut probe: P, on_cancel: C, on_deadline: D) -> TickerOutcome
    where
        P: FnMut(CancellationToken) -> PF,
        PF: Future<Output = ()>,
        C: FnOnce(),
        D: FnOnce(),
    {
        let mut ticks = interval_at(Instant::now() + self.interval, self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = sleep_until(self.deadline);
        tokio::pin!(deadline);
        let mut probes: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    let outcome = if self.parent.is_cancelled() {
                        TickerOutcome::Cancelled
                    } else {
                        TickerOutcome::Succeeded
                    };
                    debug!(key = %self.key, probes, ?outcome, "ticker cancelled");
                    on_cancel();
                    return outcome;
                }
                _ = &mut deadline => {
                    debug!(key = %self.key, probes, "ticker deadline exceeded");
                    on_deadline();
                    return TickerOutcome::DeadlineExceeded;
                }
                _ = ticks.tick() => {
                    probes += 1;
                    let attempt = probe(self.token.clone());
                    tokio::pin!(attempt);
                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => {}
                        _ = &mut deadline => {}
                        _ = &mut attempt => {}
                    }
                }
            }
        }
    }
}
