//! At-most-once consumption of an object by an actor.
//!
//! `once("faucet:X", "user:42")` succeeds the first time and fails with
//! [`CoreError::AlreadyConsumed`] on every later call with the same pair, which
//! is what turns a redelivered button press into a harmless no-op. Distinct
//! actors on the same object each succeed once.
//!
//! Registrations are process-local and are not persisted. They are dropped as
//! a whole with `remove` when the object's lifecycle ends.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::error::CoreError;

/// Two-level consumption set: object key → set of actor keys.
///
/// Operations on unrelated objects never block each other. Cheap to clone;
/// clones share registrations.
#[derive(Clone, Default)]
pub struct OnceGuard {
    objects: Arc<DashMap<String, DashSet<String>>>,
}

impl OnceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `actor` as having consumed `object`.
    pub fn once(&self, object: &str, actor: &str) -> Result<(), CoreError> {
        let actors = self.objects.entry(object.to_string()).or_default();
        if actors.insert(actor.to_string()) {
            Ok(())
        } else {
            debug!(object = %object, actor = %actor, "duplicate consumption rejected");
            Err(CoreError::AlreadyConsumed {
                object: object.to_string(),
                actor: actor.to_string(),
            })
        }
    }

    /// Forget every registration for `object`. Unknown keys are fine.
    pub fn remove(&self, object: &str) {
        self.objects.remove(object);
    }

    /// Whether `actor` has consumed `object`.
    pub fn contains(&self, object: &str, actor: &str) -> bool {
        self.objects
            .get(object)
            .is_some_and(|actors| actors.contains(actor))
    }

    /// How many actors have consumed `object`.
    pub fn consumers(&self, object: &str) -> usize {
        self.objects.get(object).map_or(0, |actors| actors.len())
    }

    /// Drop all registrations.
    pub fn clear(&self) {
        self.objects.clear();
    }
}
