//! Thread-safe engine handle with Tokio-driven mutation timeouts.
//!
//! [`Engine`] itself is synchronous and only records deadlines. A
//! [`SharedEngine`] arms one timer task per mutation and fires
//! [`Engine::handle_timeout`] when it elapses. Timers for mutations that
//! settle early are aborted after every operation.
//!
//! Listeners and callbacks run while the engine lock is held; they must not
//! call back into the same `SharedEngine`.

use crate::{
    error::Result, ClientSeq, CorrelationId, Delta, DeltaOutcome, Engine, EngineEvent, StateMap,
    SubscriptionId, TargetKey,
};
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

struct Inner {
    engine: Mutex<Engine>,
    timers: DashMap<ClientSeq, AbortHandle>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Engine> {
        // a panicking listener must not take the engine down with it
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Abort and forget timers whose mutation is no longer pending.
    fn prune_timers(&self, engine: &Engine) {
        self.timers.retain(|&client_seq, handle| {
            let keep = engine.is_pending(client_seq);
            if !keep {
                handle.abort();
            }
            keep
        });
    }

    fn fire_timeout(&self, client_seq: ClientSeq) {
        let mut engine = self.lock();
        self.timers.remove(&client_seq);
        if engine.handle_timeout(client_seq) {
            tracing::info!(client_seq, "mutation timed out");
        }
        self.prune_timers(&engine);
    }
}

/// Cloneable, thread-safe handle to an [`Engine`].
#[derive(Clone)]
pub struct SharedEngine {
    inner: Arc<Inner>,
}

impl fmt::Debug for SharedEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedEngine")
            .field("engine", &*self.inner.lock())
            .field("armed_timers", &self.inner.timers.len())
            .finish()
    }
}

impl SharedEngine {
    pub fn new(engine: Engine) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine: Mutex::new(engine),
                timers: DashMap::new(),
            }),
        }
    }

    /// Register a mutation and arm its timeout.
    ///
    /// The timer is only armed when called inside a Tokio runtime; outside
    /// one the deadline is still recorded and
    /// [`Engine::expire_timeouts`] can be driven by hand through
    /// [`SharedEngine::with_engine`].
    pub fn add_mutation<F, E>(
        &self,
        target: impl Into<TargetKey>,
        correlation_id: impl Into<CorrelationId>,
        predict: F,
    ) -> Result<Option<ClientSeq>>
    where
        F: FnOnce(&mut Value) -> std::result::Result<(), E>,
        E: fmt::Display,
    {
        let mut engine = self.inner.lock();
        let registered = engine.add_mutation(target, correlation_id, predict)?;

        if let Some(client_seq) = registered {
            let timeout_ms = engine.config().mutation_timeout_ms;
            if engine.config().timeouts_enabled() && engine.is_pending(client_seq) {
                self.arm_timer(client_seq, Duration::from_millis(timeout_ms));
            }
        }
        self.inner.prune_timers(&engine);
        Ok(registered)
    }

    fn arm_timer(&self, client_seq: ClientSeq, timeout: Duration) {
        let Ok(runtime) = Handle::try_current() else {
            tracing::debug!(client_seq, "no tokio runtime, timeout not armed");
            return;
        };
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                inner.fire_timeout(client_seq);
            }
        });
        self.inner.timers.insert(client_seq, task.abort_handle());
    }

    pub fn confirm(&self, client_seq: ClientSeq, result: Option<&Value>) -> bool {
        self.with_engine(|engine| engine.confirm(client_seq, result))
    }

    pub fn confirm_correlated(&self, correlation_id: &str, result: Option<&Value>) -> bool {
        self.with_engine(|engine| engine.confirm_correlated(correlation_id, result))
    }

    pub fn reject(&self, client_seq: ClientSeq, reason: impl Into<String>) -> bool {
        self.with_engine(|engine| engine.reject(client_seq, reason))
    }

    pub fn reject_correlated(&self, correlation_id: &str, reason: impl Into<String>) -> bool {
        self.with_engine(|engine| engine.reject_correlated(correlation_id, reason))
    }

    pub fn apply_delta(&self, delta: Delta) -> DeltaOutcome {
        self.with_engine(|engine| engine.apply_delta(delta))
    }

    pub fn apply_deltas(&self, deltas: impl IntoIterator<Item = Delta>) -> Vec<DeltaOutcome> {
        self.with_engine(|engine| engine.apply_deltas(deltas))
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: FnMut(&EngineEvent) + Send + 'static,
    {
        self.with_engine(|engine| engine.subscribe(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.with_engine(|engine| engine.unsubscribe(id))
    }

    pub fn optimistic_state(&self) -> Arc<StateMap> {
        self.read(Engine::optimistic_state)
    }

    pub fn confirmed_state(&self) -> Arc<StateMap> {
        self.read(Engine::confirmed_state)
    }

    /// Run a read-only closure against the engine.
    pub fn read<R>(&self, f: impl FnOnce(&Engine) -> R) -> R {
        f(&*self.inner.lock())
    }

    /// Run a closure with exclusive access, then drop timers of settled
    /// mutations. Mutations added here get no timer.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        let mut engine = self.inner.lock();
        let result = f(&mut *engine);
        self.inner.prune_timers(&engine);
        result
    }

    /// Number of timers currently armed.
    pub fn armed_timers(&self) -> usize {
        self.inner.timers.len()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
    }
}
