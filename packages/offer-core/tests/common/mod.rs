// Common test utilities

use std::path::PathBuf;
use std::time::Duration;

use offer_core::{CoreConfig, RecordData};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Initialize tracing once, respecting RUST_LOG.
/// Run tests with: RUST_LOG=debug cargo test -- --nocapture
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh store directory under the system temp dir.
pub fn temp_store_path() -> PathBuf {
    std::env::temp_dir().join(format!("offer-core-test-{}", Uuid::new_v4()))
}

/// Config with short lease timings so contention tests finish quickly.
pub fn fast_config(store_path: PathBuf) -> CoreConfig {
    CoreConfig {
        store_path,
        lease_poll_interval: Duration::from_millis(10),
        lease_wait_timeout: Duration::from_secs(5),
        lease_ttl: None,
        handler_timeout: Duration::from_secs(5),
        ..CoreConfig::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Faucet {
    pub owner: String,
    pub remaining: u64,
    pub per_user: u64,
}

impl RecordData for Faucet {
    const NAMESPACE: &'static str = "faucet";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    SendInvoice,
    FaucetTopUp,
}
