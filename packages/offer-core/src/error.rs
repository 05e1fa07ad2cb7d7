//! Structured error types for the offer core.
//!
//! `CoreError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//! Handlers and settlement callbacks still return `anyhow::Result` (ergonomic
//! for domain code); the core's own failures travel inside as `CoreError` and
//! can be recovered with `downcast_ref`.
//!
//! # Error Example
//!
//! ```ignore
//! use offer_core::CoreError;
//!
//! match chain.invoke(trigger, &shutdown).await {
//!     Ok(()) => {}
//!     Err(e) => match e.downcast_ref::<CoreError>() {
//!         Some(CoreError::AlreadyConsumed { .. }) => { /* duplicate tap, ignore */ }
//!         Some(err) if err.category() == ErrorCategory::TryAgainLater => {
//!             /* tell the user to retry */
//!         }
//!         _ => tracing::error!(error = %e, "trigger failed"),
//!     },
//! }
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

// =============================================================================
// Error Category
// =============================================================================

/// Coarse classification of a core failure for the presentation layer.
///
/// The core carries no user-facing text. Collaborators map a category to
/// whatever message their localization layer produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Contention or a transient backend problem. The user may retry.
    TryAgainLater,
    /// The action was refused (already consumed, record inactive).
    Rejected,
    /// The referenced record does not exist.
    NotFound,
    /// A wiring or programming error (missing registration, codec failure).
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::TryAgainLater => write!(f, "try_again_later"),
            ErrorCategory::Rejected => write!(f, "rejected"),
            ErrorCategory::NotFound => write!(f, "not_found"),
            ErrorCategory::Internal => write!(f, "internal_error"),
        }
    }
}

// =============================================================================
// Core Error
// =============================================================================

/// Errors produced by the offer core.
///
/// None of these are fatal to the process. Each is returned to the immediate
/// caller; the only internal retry loop is [`RetryTicker`](crate::RetryTicker),
/// which is opt-in per use site.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A lease stayed held past the absolute wait deadline.
    #[error("lease on {key} still held after {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    /// The caller's lease was reclaimed by someone else before it released.
    /// Nothing the caller meant to write was persisted.
    #[error("lease on {key} is no longer held by this caller")]
    LeaseLost { key: String },

    /// The (object, actor) pair was already registered with the once guard.
    #[error("{actor} already consumed {object}")]
    AlreadyConsumed { object: String, actor: String },

    /// The durable store has no record under this key.
    #[error("record not found: {key}")]
    RecordNotFound { key: String },

    /// A mutation was attempted on a record with `active = false`.
    #[error("record is inactive: {key}")]
    RecordInactive { key: String },

    /// No settlement callback is registered for the stored event kind.
    #[error("no settlement callback registered for kind {kind}")]
    CallbackNotRegistered { kind: String },

    /// A second callback was registered for the same kind.
    #[error("settlement callback already registered for kind {kind}")]
    CallbackAlreadyRegistered { kind: String },

    /// No interceptor chain is registered for the trigger name.
    #[error("no handler registered for trigger {trigger}")]
    NoHandlerRegistered { trigger: String },

    /// A second chain was registered for the same trigger name.
    #[error("handler already registered for trigger {trigger}")]
    HandlerAlreadyRegistered { trigger: String },

    /// The caller's cancellation token fired while waiting for a lock.
    #[error("cancelled while waiting for lock {key}")]
    Cancelled { key: String },

    /// The handler did not finish within the chain's timeout.
    #[error("handler for {trigger} timed out after {after:?}")]
    HandlerTimeout { trigger: String, after: Duration },

    /// The handler or an interceptor step panicked. Deferred steps still ran.
    #[error("handler for {trigger} panicked")]
    HandlerPanicked { trigger: String },

    /// An earlier dispatch ran the callback but could not record the result.
    /// Running the callback again could settle twice, so it is left to an
    /// operator.
    #[error("settlement of {key} is in doubt")]
    SettlementInDoubt { key: String },

    /// A settlement callback returned an error or panicked.
    #[error("settlement callback for kind {kind} failed: {source}")]
    CallbackFailed {
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    /// A record could not be encoded or decoded.
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Pass-through failure from the durable store collaborator.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoreError {
    /// Map this error to a presentation category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::LockTimeout { .. }
            | CoreError::LeaseLost { .. }
            | CoreError::Cancelled { .. }
            | CoreError::HandlerTimeout { .. }
            | CoreError::CallbackFailed { .. } => ErrorCategory::TryAgainLater,
            CoreError::Store(StoreError::Conflict) => ErrorCategory::TryAgainLater,
            CoreError::Store(StoreError::Backend(_)) => ErrorCategory::TryAgainLater,
            CoreError::AlreadyConsumed { .. } | CoreError::RecordInactive { .. } => {
                ErrorCategory::Rejected
            }
            CoreError::RecordNotFound { .. } => ErrorCategory::NotFound,
            CoreError::CallbackNotRegistered { .. }
            | CoreError::CallbackAlreadyRegistered { .. }
            | CoreError::NoHandlerRegistered { .. }
            | CoreError::HandlerAlreadyRegistered { .. }
            | CoreError::HandlerPanicked { .. }
            | CoreError::SettlementInDoubt { .. }
            | CoreError::Codec(_) => ErrorCategory::Internal,
        }
    }

    /// Whether re-delivering the same trigger could succeed.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::TryAgainLater
    }
}

/// Recover a [`CoreError`] from an `anyhow` chain, if one is present.
pub fn core_error(err: &anyhow::Error) -> Option<&CoreError> {
    err.chain().find_map(|cause| cause.downcast_ref::<CoreError>())
}

/// Extract a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
