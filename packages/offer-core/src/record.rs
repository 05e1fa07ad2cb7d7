//! The persisted record shape shared by every offer and transaction type.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::CoreError;

/// Domain payload of a record type.
///
/// The payload is opaque to the core. `NAMESPACE` scopes record ids: the
/// durable key of a record is `"{NAMESPACE}/{id}"`.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Faucet {
///     owner: String,
///     remaining: u64,
///     per_user: u64,
/// }
///
/// impl RecordData for Faucet {
///     const NAMESPACE: &'static str = "faucet";
/// }
/// ```
pub trait RecordData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const NAMESPACE: &'static str;
}

/// Durable key for a record id in namespace `T`.
pub fn storage_key<T: RecordData>(id: &str) -> String {
    format!("{}/{}", T::NAMESPACE, id)
}

/// A persisted offer or transaction.
///
/// `active` starts `true` and flips to `false` exactly once, on completion or
/// cancellation. `in_transaction` is the lease flag used by
/// [`TransactionalStore`](crate::TransactionalStore); plain entity reads and
/// writes carry it along untouched.
///
/// Top-level fields written by other collaborators are kept in `extra` and
/// written back unchanged. New optional fields default, so the stored shape
/// can grow without breaking older readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity<T> {
    pub id: String,
    pub active: bool,
    #[serde(default)]
    pub in_transaction: bool,
    #[serde(default)]
    pub lease_acquired_at: Option<DateTime<Utc>>,
    /// Identifies the current lease. Only the holder of this token may
    /// release it.
    #[serde(default)]
    pub lease_token: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: T,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl<T: RecordData> Entity<T> {
    /// A fresh, active record.
    pub fn new(id: impl Into<String>, data: T) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            active: true,
            in_transaction: false,
            lease_acquired_at: None,
            lease_token: None,
            created_at: now,
            updated_at: now,
            data,
            extra: Map::new(),
        }
    }

    /// The durable key of this record.
    pub fn key(&self) -> String {
        storage_key::<T>(&self.id)
    }

    /// Fail with [`CoreError::RecordInactive`] if the record is no longer active.
    pub fn ensure_active(&self) -> Result<(), CoreError> {
        if self.active {
            Ok(())
        } else {
            Err(CoreError::RecordInactive { key: self.key() })
        }
    }

    /// Whether a lease is held and, given `ttl`, not yet abandoned.
    pub fn lease_is_live(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> bool {
        if !self.in_transaction {
            return false;
        }
        match (ttl, self.lease_acquired_at) {
            (Some(ttl), Some(acquired)) => match chrono::Duration::from_std(ttl) {
                Ok(ttl) => now - acquired < ttl,
                Err(_) => true,
            },
            _ => true,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether `token` names the lease currently recorded on this entity.
    pub fn is_leased_by(&self, token: Option<Uuid>) -> bool {
        self.in_transaction && token.is_some() && self.lease_token == token
    }

    pub(crate) fn set_lease(&mut self, held: bool) {
        self.in_transaction = held;
        if held {
            self.lease_acquired_at = Some(Utc::now());
            self.lease_token = Some(Uuid::new_v4());
        } else {
            self.lease_acquired_at = None;
            self.lease_token = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct SendOffer {
        amount: u64,
    }

    impl RecordData for SendOffer {
        const NAMESPACE: &'static str = "send";
    }

    #[test]
    fn test_new_entity_is_active_and_unleased() {
        let entity = Entity::new("send:abc", SendOffer { amount: 21 });
        assert!(entity.active);
        assert!(!entity.in_transaction);
        assert_eq!(entity.key(), "send/send:abc");
        assert!(entity.ensure_active().is_ok());
    }

    #[test]
    fn test_inactive_entity_is_rejected() {
        let mut entity = Entity::new("send:abc", SendOffer { amount: 21 });
        entity.active = false;
        assert!(matches!(
            entity.ensure_active(),
            Err(CoreError::RecordInactive { .. })
        ));
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let json = serde_json::json!({
            "id": "send:abc",
            "active": true,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
            "data": { "amount": 5, "memo": "added by another service" },
            "language": "de"
        });

        let entity: Entity<SendOffer> = serde_json::from_value(json).unwrap();
        assert_eq!(entity.data, SendOffer { amount: 5 });
        assert!(!entity.in_transaction);
        assert!(entity.lease_acquired_at.is_none());
        assert!(entity.lease_token.is_none());

        let written = serde_json::to_value(&entity).unwrap();
        assert_eq!(written["language"], "de");
        assert!(written.get("extra").is_none());
    }

    #[test]
    fn test_each_lease_gets_a_fresh_token() {
        let mut entity = Entity::new("send:abc", SendOffer { amount: 21 });
        assert!(!entity.is_leased_by(None));

        entity.set_lease(true);
        let first = entity.lease_token;
        assert!(entity.is_leased_by(first));

        entity.set_lease(true);
        assert!(!entity.is_leased_by(first));
        assert!(entity.is_leased_by(entity.lease_token));

        entity.set_lease(false);
        assert!(entity.lease_token.is_none());
        assert!(!entity.is_leased_by(first));
    }

    #[test]
    fn test_lease_expiry() {
        let mut entity = Entity::new("send:abc", SendOffer { amount: 21 });
        entity.set_lease(true);
        let acquired = entity.lease_acquired_at.unwrap();

        let ttl = Some(Duration::from_secs(60));
        assert!(entity.lease_is_live(acquired + chrono::Duration::seconds(30), ttl));
        assert!(!entity.lease_is_live(acquired + chrono::Duration::seconds(61), ttl));
        // Without a ttl a lease never expires on its own.
        assert!(entity.lease_is_live(acquired + chrono::Duration::days(7), None));

        entity.set_lease(false);
        assert!(!entity.lease_is_live(acquired, ttl));
    }
}
