use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::lease::LeaseSettings;

/// Core configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Directory of the embedded durable store
    pub store_path: PathBuf,
    pub cache_ttl: Duration,
    pub lease_poll_interval: Duration,
    pub lease_wait_timeout: Duration,
    /// `None` disables lease expiry
    pub lease_ttl: Option<Duration>,
    pub handler_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data/offers"),
            cache_ttl: Duration::from_secs(300),
            lease_poll_interval: Duration::from_millis(500),
            lease_wait_timeout: Duration::from_secs(10),
            lease_ttl: Some(Duration::from_secs(120)),
            handler_timeout: Duration::from_secs(30),
        }
    }
}

impl CoreConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from any variable source, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let lease_ttl_secs: u64 = parse_or(&lookup, "OFFER_LEASE_TTL_SECS", 120)?;

        Ok(Self {
            store_path: lookup("OFFER_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            cache_ttl: Duration::from_secs(parse_or(&lookup, "OFFER_CACHE_TTL_SECS", 300)?),
            lease_poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "OFFER_LEASE_POLL_MS",
                500,
            )?),
            lease_wait_timeout: Duration::from_millis(parse_or(
                &lookup,
                "OFFER_LEASE_WAIT_MS",
                10_000,
            )?),
            lease_ttl: (lease_ttl_secs > 0).then(|| Duration::from_secs(lease_ttl_secs)),
            handler_timeout: Duration::from_secs(parse_or(
                &lookup,
                "OFFER_HANDLER_TIMEOUT_SECS",
                30,
            )?),
        })
    }

    pub fn lease_settings(&self) -> LeaseSettings {
        LeaseSettings {
            poll_interval: self.lease_poll_interval,
            wait_timeout: self.lease_wait_timeout,
            ttl: self.lease_ttl,
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        None => Ok(default),
    }
}
