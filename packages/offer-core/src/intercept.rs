//! Interceptor chains around inbound trigger handlers.
//!
//! # Overview
//!
//! Every inbound trigger (a chat command, a button press, an inline query)
//! runs through an [`InterceptorChain`]:
//!
//! ```text
//! AcquireActorLock ─► before… ─► handler (timeout, panic capture) ─► after…
//!                                                                       │
//!                       defer… ─► ReleaseActorLock  ◄───── always ──────┘
//! ```
//!
//! The builder inserts `AcquireActorLock` as the first before step and
//! `ReleaseActorLock` as the last defer step. Those two are not optional: one
//! actor's triggers are serialized with respect to each other.
//!
//! # The Contract
//!
//! 1. **Before steps gate.** The first before-step error aborts the trigger:
//!    later before steps, the handler and after steps do not run.
//! 2. **Defer steps always run**, on success, failure, panic and timeout.
//!    Their own errors are logged, never returned.
//! 3. **Panics are contained.** A panic in the handler or in a before or
//!    after step becomes [`CoreError::HandlerPanicked`].
//! 4. **Bounded handlers.** With a timeout configured, a slow handler is
//!    dropped, the trigger's token is cancelled (which also releases the
//!    actor lock bound to it) and the chain returns
//!    [`CoreError::HandlerTimeout`].
//! 5. **Abort on lock failure.** If the actor lock cannot be taken because the
//!    trigger was cancelled, the trigger is aborted with
//!    [`CoreError::Cancelled`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::entity::EntityStore;
use crate::error::{panic_message, CoreError};
use crate::mutex::{FlowId, KeyGuard, MutexManager};
use crate::record::{Entity, RecordData};

// =============================================================================
// Trigger
// =============================================================================

/// Where an inbound trigger came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerKind {
    Command,
    Button,
    InlineQuery,
}

/// An inbound message, button press or inline query, already parsed by the
/// transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    /// Stable identity of the user who caused it.
    pub actor: String,
    pub kind: TriggerKind,
    /// Routing name (`"send"`, `"faucet_claim"`).
    pub name: String,
    /// Command arguments or button payload.
    #[serde(default)]
    pub data: String,
    /// Transport delivery id, if the transport provides one.
    #[serde(default)]
    pub delivery_id: Option<String>,
}

impl Trigger {
    pub fn new(
        kind: TriggerKind,
        actor: impl Into<String>,
        name: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            kind,
            name: name.into(),
            data: data.into(),
            delivery_id: None,
        }
    }

    pub fn command(actor: impl Into<String>, name: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(TriggerKind::Command, actor, name, data)
    }

    pub fn button(actor: impl Into<String>, name: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(TriggerKind::Button, actor, name, data)
    }

    pub fn with_delivery_id(mut self, id: impl Into<String>) -> Self {
        self.delivery_id = Some(id.into());
        self
    }

    /// The mutex key serializing this actor's triggers.
    pub fn actor_key(&self) -> String {
        format!("actor:{}", self.actor)
    }
}

// =============================================================================
// Trigger Context
// =============================================================================

/// Per-invocation state shared by interceptors and the handler.
pub struct TriggerContext {
    trigger: Trigger,
    flow: FlowId,
    cancel: CancellationToken,
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    actor_guard: Option<KeyGuard>,
}

impl TriggerContext {
    pub fn new(trigger: Trigger, cancel: CancellationToken) -> Self {
        Self {
            trigger,
            flow: FlowId::new(),
            cancel,
            extensions: HashMap::new(),
            actor_guard: None,
        }
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Identity of this invocation, for soft locks taken by nested calls.
    pub fn flow(&self) -> FlowId {
        self.flow
    }

    /// Cancelled on timeout or when the parent token fires.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Store a value for later steps. Replaces any value of the same type.
    pub fn insert<V: Send + Sync + 'static>(&mut self, value: V) {
        self.extensions.insert(TypeId::of::<V>(), Box::new(value));
    }

    pub fn get<V: Send + Sync + 'static>(&self) -> Option<&V> {
        self.extensions
            .get(&TypeId::of::<V>())
            .and_then(|boxed| boxed.downcast_ref::<V>())
    }

    pub fn get_mut<V: Send + Sync + 'static>(&mut self) -> Option<&mut V> {
        self.extensions
            .get_mut(&TypeId::of::<V>())
            .and_then(|boxed| boxed.downcast_mut::<V>())
    }

    pub fn take<V: Send + Sync + 'static>(&mut self) -> Option<V> {
        self.extensions
            .remove(&TypeId::of::<V>())
            .and_then(|boxed| boxed.downcast::<V>().ok())
            .map(|boxed| *boxed)
    }

    /// Whether this invocation currently holds its actor lock.
    pub fn holds_actor_lock(&self) -> bool {
        self.actor_guard.as_ref().is_some_and(KeyGuard::is_held)
    }
}

impl fmt::Debug for TriggerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerContext")
            .field("trigger", &self.trigger)
            .field("flow", &self.flow)
            .field("extensions", &self.extensions.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Interceptors
// =============================================================================

/// A step run before, after, or deferred around a trigger handler.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn intercept(&self, ctx: &mut TriggerContext) -> anyhow::Result<()>;
}

/// The business logic for one trigger name.
#[async_trait]
pub trait TriggerHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut TriggerContext) -> anyhow::Result<()>;
}

/// Takes the actor's exclusive lock, bound to the trigger's token.
pub struct AcquireActorLock {
    mutexes: MutexManager,
}

impl AcquireActorLock {
    pub fn new(mutexes: MutexManager) -> Self {
        Self { mutexes }
    }
}

#[async_trait]
impl Interceptor for AcquireActorLock {
    fn name(&self) -> &'static str {
        "acquire_actor_lock"
    }

    async fn intercept(&self, ctx: &mut TriggerContext) -> anyhow::Result<()> {
        let key = ctx.trigger.actor_key();
        let guard = self.mutexes.lock_with_cancel(&key, &ctx.cancel).await?;
        ctx.actor_guard = Some(guard);
        Ok(())
    }
}

/// Drops the actor lock taken by [`AcquireActorLock`].
pub struct ReleaseActorLock;

#[async_trait]
impl Interceptor for ReleaseActorLock {
    fn name(&self) -> &'static str {
        "release_actor_lock"
    }

    async fn intercept(&self, ctx: &mut TriggerContext) -> anyhow::Result<()> {
        drop(ctx.actor_guard.take());
        Ok(())
    }
}

/// Logs every trigger entering the chain.
pub struct LogTrigger;

#[async_trait]
impl Interceptor for LogTrigger {
    fn name(&self) -> &'static str {
        "log_trigger"
    }

    async fn intercept(&self, ctx: &mut TriggerContext) -> anyhow::Result<()> {
        let trigger = &ctx.trigger;
        info!(
            trigger = %trigger.name,
            kind = ?trigger.kind,
            actor = %trigger.actor,
            flow = %ctx.flow,
            delivery = ?trigger.delivery_id,
            "trigger received"
        );
        Ok(())
    }
}

type IdExtractor = dyn Fn(&Trigger) -> Option<String> + Send + Sync;

/// Loads the record a trigger refers to and stores it in the context.
///
/// Rejects the trigger with [`CoreError::RecordNotFound`] when no id can be
/// derived or nothing is stored under it, and with
/// [`CoreError::RecordInactive`] for inactive records. The handler reads the
/// record with `ctx.get::<Entity<T>>()`.
pub struct LoadRecord<T: RecordData> {
    entities: EntityStore<T>,
    id_of: Box<IdExtractor>,
}

impl<T: RecordData> LoadRecord<T> {
    pub fn new<F>(entities: EntityStore<T>, id_of: F) -> Self
    where
        F: Fn(&Trigger) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            entities,
            id_of: Box::new(id_of),
        }
    }

    /// Use the trigger's `data` as the record id.
    pub fn by_data(entities: EntityStore<T>) -> Self {
        Self::new(entities, |trigger| {
            let id = trigger.data.trim();
            (!id.is_empty()).then(|| id.to_string())
        })
    }
}

#[async_trait]
impl<T: RecordData> Interceptor for LoadRecord<T> {
    fn name(&self) -> &'static str {
        "load_record"
    }

    async fn intercept(&self, ctx: &mut TriggerContext) -> anyhow::Result<()> {
        let id = (self.id_of)(&ctx.trigger).ok_or_else(|| CoreError::RecordNotFound {
            key: format!("{}/", T::NAMESPACE),
        })?;
        let entity: Entity<T> = self.entities.get(&id).await?;
        entity.ensure_active()?;
        ctx.insert(entity);
        Ok(())
    }
}

// =============================================================================
// Chain
// =============================================================================

/// A handler wrapped in its before, after and defer steps.
pub struct InterceptorChain {
    before: Vec<Box<dyn Interceptor>>,
    after: Vec<Box<dyn Interceptor>>,
    deferred: Vec<Box<dyn Interceptor>>,
    handler: Box<dyn TriggerHandler>,
    timeout: Option<Duration>,
}

/// Builder for [`InterceptorChain`].
pub struct ChainBuilder {
    mutexes: MutexManager,
    before: Vec<Box<dyn Interceptor>>,
    after: Vec<Box<dyn Interceptor>>,
    deferred: Vec<Box<dyn Interceptor>>,
    timeout: Option<Duration>,
}

impl ChainBuilder {
    pub fn before<I: Interceptor>(mut self, step: I) -> Self {
        self.before.push(Box::new(step));
        self
    }

    pub fn after<I: Interceptor>(mut self, step: I) -> Self {
        self.after.push(Box::new(step));
        self
    }

    pub fn defer<I: Interceptor>(mut self, step: I) -> Self {
        self.deferred.push(Box::new(step));
        self
    }

    /// Bound the handler's running time.
    pub fn timeout(mut self, after: Duration) -> Self {
        self.timeout = Some(after);
        self
    }

    pub fn build<H: TriggerHandler>(self, handler: H) -> InterceptorChain {
        let mut before: Vec<Box<dyn Interceptor>> = Vec::with_capacity(self.before.len() + 1);
        before.push(Box::new(AcquireActorLock::new(self.mutexes)));
        before.extend(self.before);

        let mut deferred = self.deferred;
        deferred.push(Box::new(ReleaseActorLock));

        InterceptorChain {
            before,
            after: self.after,
            deferred,
            handler: Box::new(handler),
            timeout: self.timeout,
        }
    }
}

impl InterceptorChain {
    pub fn builder(mutexes: MutexManager) -> ChainBuilder {
        ChainBuilder {
            mutexes,
            before: Vec::new(),
            after: Vec::new(),
            deferred: Vec::new(),
            timeout: None,
        }
    }

    /// Run the chain for one trigger.
    ///
    /// The trigger's token is a child of `parent`, so cancelling `parent`
    /// (shutdown) cancels every trigger in flight.
    pub async fn invoke(&self, trigger: Trigger, parent: &CancellationToken) -> anyhow::Result<()> {
        let mut ctx = TriggerContext::new(trigger, parent.child_token());
        debug!(trigger = %ctx.trigger.name, actor = %ctx.trigger.actor, flow = %ctx.flow, "invoking chain");

        let name = ctx.trigger.name.clone();
        let result = match AssertUnwindSafe(self.run(&mut ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                error!(trigger = %name, panic = %panic_message(&*panic), "interceptor panicked");
                Err(CoreError::HandlerPanicked { trigger: name }.into())
            }
        };

        for step in &self.deferred {
            if let Err(e) = step.intercept(&mut ctx).await {
                warn!(step = step.name(), trigger = %ctx.trigger.name, error = %e, "deferred step failed");
            }
        }

        if let Err(e) = &result {
            debug!(trigger = %ctx.trigger.name, actor = %ctx.trigger.actor, error = %e, "trigger aborted");
        }
        result
    }

    async fn run(&self, ctx: &mut TriggerContext) -> anyhow::Result<()> {
        for step in &self.before {
            if let Err(e) = step.intercept(ctx).await {
                debug!(step = step.name(), trigger = %ctx.trigger.name, error = %e, "before step rejected trigger");
                return Err(e);
            }
        }

        self.call_handler(ctx).await?;

        for step in &self.after {
            step.intercept(ctx).await?;
        }
        Ok(())
    }

    async fn call_handler(&self, ctx: &mut TriggerContext) -> anyhow::Result<()> {
        let name = ctx.trigger.name.clone();

        let outcome = match self.timeout {
            Some(after) => {
                let guarded = AssertUnwindSafe(self.handler.handle(ctx)).catch_unwind();
                match tokio::time::timeout(after, guarded).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        ctx.cancel.cancel();
                        // The cancel watcher would release it too, but asynchronously.
                        drop(ctx.actor_guard.take());
                        warn!(trigger = %name, after = ?after, "handler timed out");
                        return Err(CoreError::HandlerTimeout {
                            trigger: name,
                            after,
                        }
                        .into());
                    }
                }
            }
            None => AssertUnwindSafe(self.handler.handle(ctx)).catch_unwind().await,
        };

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                error!(trigger = %name, panic = %panic_message(&*panic), "handler panicked");
                Err(CoreError::HandlerPanicked { trigger: name }.into())
            }
        }
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |steps: &[Box<dyn Interceptor>]| steps.iter().map(|s| s.name()).collect::<Vec<_>>();
        f.debug_struct("InterceptorChain")
            .field("before", &names(&self.before))
            .field("after", &names(&self.after))
            .field("deferred", &names(&self.deferred))
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Router
// =============================================================================

/// One chain per trigger name.
#[derive(Default)]
pub struct TriggerRouter {
    chains: HashMap<String, Arc<InterceptorChain>>,
}

impl TriggerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the chain for `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` already has a chain. Use
    /// [`try_register`](Self::try_register) for a non-panicking version.
    pub fn register(&mut self, name: impl Into<String>, chain: InterceptorChain) {
        if let Err(e) = self.try_register(name, chain) {
            panic!("{}", e);
        }
    }

    pub fn try_register(
        &mut self,
        name: impl Into<String>,
        chain: InterceptorChain,
    ) -> Result<(), CoreError> {
        let name = name.into();
        if self.chains.contains_key(&name) {
            return Err(CoreError::HandlerAlreadyRegistered { trigger: name });
        }
        self.chains.insert(name, Arc::new(chain));
        Ok(())
    }

    /// Run the chain registered for `trigger.name`.
    pub async fn route(&self, trigger: Trigger, parent: &CancellationToken) -> anyhow::Result<()> {
        let Some(chain) = self.chains.get(&trigger.name).cloned() else {
            debug!(trigger = %trigger.name, actor = %trigger.actor, "no handler for trigger");
            return Err(CoreError::NoHandlerRegistered {
                trigger: trigger.name,
            }
            .into());
        };
        chain.invoke(trigger, parent).await
    }

    pub fn names(&self) -> Vec<&str> {
        self.chains.keys().map(String::as_str).collect()
    }
}
