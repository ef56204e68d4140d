//! The reconciliation engine.
//!
//! Holds confirmed state (built only from server deltas), the mutation
//! ledger, and optimistic state (confirmed + ledger, replayed in order).
//!
//! # Delta pipeline
//!
//! 1. Discard stale deltas (`server_seq <= confirmed_server_seq`)
//! 2. Discard gapped deltas and ask the caller for the missing range
//! 3. Resolve conflicts with pending mutations predicted before the delta
//! 4. Apply the winning patch to confirmed state (all-or-nothing)
//! 5. Drop settled mutations from the ledger, honour ack shortcuts
//! 6. Recompute optimistic state and notify once

use crate::{
    error::Result, patch, resolve, ClientSeq, CorrelationId, Delta, DeltaOutcome, EngineConfig,
    Error, MutationLedger, Patch, PendingMutation, Registration, ResolutionOutcome, ServerSeq,
    StateMap, StreamId, SyncError, TargetKey, Timestamp,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Applies a patch to one confirmed slice; `None` means failure.
pub type DeltaApplicator = Box<dyn Fn(&Value, &Patch) -> Option<Value> + Send + Sync>;
/// Asked to re-deliver deltas `from..=to` for a stream.
pub type RangeRequester = Box<dyn Fn(&str, ServerSeq, ServerSeq) + Send + Sync>;
/// Receives every non-fatal failure.
pub type ErrorSink = Box<dyn Fn(&SyncError) + Send + Sync>;
/// Milliseconds since epoch.
pub type Clock = Box<dyn Fn() -> Timestamp + Send + Sync>;
/// State change listener.
pub type Listener = Box<dyn FnMut(&EngineEvent) + Send>;

/// Handle returned by [`Engine::subscribe`].
pub type SubscriptionId = u64;

/// Gap tracking state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Deltas are contiguous
    Synced,
    /// A gap was seen; `from..=to` was requested and deltas are dropped
    /// until a contiguous one arrives
    GapPending { from: ServerSeq, to: ServerSeq },
}

/// Why pending mutations were rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackReason {
    Rejected(String),
    TimedOut,
    /// Dropped to keep the ledger within `max_pending_mutations`
    Evicted,
}

/// What triggered a state change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    MutationAdded(ClientSeq),
    Confirmed(ClientSeq),
    RolledBack(ClientSeq),
    DeltaApplied(ServerSeq),
}

/// Events delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Optimistic state changed
    Changed {
        optimistic: Arc<StateMap>,
        confirmed_server_seq: ServerSeq,
        cause: ChangeCause,
    },
    /// Mutations were discarded. `inverse` holds their undo patches, most
    /// recent first, for listeners that keep their own copy of state.
    /// Always followed by a `Changed` event.
    RolledBack {
        reason: RollbackReason,
        client_seqs: Vec<ClientSeq>,
        inverse: Vec<(TargetKey, Patch)>,
    },
}

/// The optimistic synchronization engine.
pub struct Engine {
    config: EngineConfig,
    confirmed: Arc<StateMap>,
    optimistic: Arc<StateMap>,
    confirmed_server_seq: ServerSeq,
    ledger: MutationLedger,
    streams: HashMap<StreamId, StreamStatus>,
    listeners: BTreeMap<SubscriptionId, Listener>,
    next_subscription: SubscriptionId,
    applicator: DeltaApplicator,
    request_missing_range: Option<RangeRequester>,
    on_error: Option<ErrorSink>,
    clock: Clock,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("confirmed_server_seq", &self.confirmed_server_seq)
            .field("pending", &self.ledger.len())
            .field("streams", &self.streams)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Builder for an [`Engine`] and its callbacks.
pub struct EngineBuilder {
    config: EngineConfig,
    state: StateMap,
    applicator: Option<DeltaApplicator>,
    request_missing_range: Option<RangeRequester>,
    on_error: Option<ErrorSink>,
    clock: Option<Clock>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: StateMap::new(),
            applicator: None,
            request_missing_range: None,
            on_error: None,
            clock: None,
        }
    }

    /// Replace the whole initial confirmed state.
    pub fn initial_state(mut self, state: StateMap) -> Self {
        self.state = state;
        self
    }

    /// Set the initial confirmed value of one target.
    pub fn state(mut self, target: impl Into<TargetKey>, value: Value) -> Self {
        self.state.insert(target.into(), value);
        self
    }

    /// Override how deltas are applied to confirmed state.
    pub fn delta_applicator<F>(mut self, applicator: F) -> Self
    where
        F: Fn(&Value, &Patch) -> Option<Value> + Send + Sync + 'static,
    {
        self.applicator = Some(Box::new(applicator));
        self
    }

    /// Called with `(stream, from, to)` when a gap is detected.
    pub fn request_missing_range<F>(mut self, request: F) -> Self
    where
        F: Fn(&str, ServerSeq, ServerSeq) + Send + Sync + 'static,
    {
        self.request_missing_range = Some(Box::new(request));
        self
    }

    /// Sink for non-fatal failures.
    pub fn on_error<F>(mut self, sink: F) -> Self
    where
        F: Fn(&SyncError) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(sink));
        self
    }

    /// Time source for mutation timestamps and deadlines.
    pub fn clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> Timestamp + Send + Sync + 'static,
    {
        self.clock = Some(Box::new(clock));
        self
    }

    pub fn build(self) -> Engine {
        let max_pending = self.config.max_pending_mutations;
        let confirmed = Arc::new(self.state);
        Engine {
            confirmed_server_seq: self.config.initial_server_seq,
            config: self.config,
            optimistic: Arc::new(confirmed.as_ref().clone()),
            confirmed,
            ledger: MutationLedger::new(max_pending),
            streams: HashMap::new(),
            listeners: BTreeMap::new(),
            next_subscription: 1,
            applicator: self
                .applicator
                .unwrap_or_else(|| Box::new(|state, patch| patch::applied(state, patch).ok())),
            request_missing_range: self.request_missing_range,
            on_error: self.on_error,
            clock: self.clock.unwrap_or_else(|| Box::new(system_now_ms)),
        }
    }
}

fn system_now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as Timestamp)
        .unwrap_or(0)
}

impl Engine {
    /// Create an engine with empty state and default callbacks.
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------

    /// Snapshot of confirmed state. Never changes after it is returned.
    pub fn confirmed_state(&self) -> Arc<StateMap> {
        Arc::clone(&self.confirmed)
    }

    /// Snapshot of optimistic state. Never changes after it is returned.
    pub fn optimistic_state(&self) -> Arc<StateMap> {
        Arc::clone(&self.optimistic)
    }

    /// Confirmed value of one target.
    pub fn confirmed(&self, target: &str) -> Option<&Value> {
        self.confirmed.get(target)
    }

    /// Optimistic value of one target.
    pub fn optimistic(&self, target: &str) -> Option<&Value> {
        self.optimistic.get(target)
    }

    pub fn confirmed_server_seq(&self) -> ServerSeq {
        self.confirmed_server_seq
    }

    /// Pending mutations in ledger order.
    pub fn pending_mutations(&self) -> &[PendingMutation] {
        self.ledger.entries()
    }

    pub fn is_pending(&self, client_seq: ClientSeq) -> bool {
        self.ledger.contains(client_seq)
    }

    /// Gap status of a stream. Streams never seen are synced.
    pub fn stream_status(&self, stream: &str) -> StreamStatus {
        self.streams
            .get(stream)
            .copied()
            .unwrap_or(StreamStatus::Synced)
    }

    /// Allocate a client sequence number without registering anything.
    pub fn next_client_seq(&mut self) -> ClientSeq {
        self.ledger.next_client_seq()
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&EngineEvent) + Send + 'static,
    {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.listeners.insert(id, Box::new(listener));
        id
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Register a speculative change to `target`.
    ///
    /// `predict` edits a copy of the target's optimistic value; the
    /// difference becomes the mutation's patch. Returns `Ok(None)` when
    /// `predict` fails (reported as [`SyncError::Produce`], nothing is
    /// registered) or when replaying the ledger afterwards failed and
    /// dropped every pending mutation. An empty `correlation_id` is a caller bug and the only
    /// case that returns an error.
    pub fn add_mutation<F, E>(
        &mut self,
        target: impl Into<TargetKey>,
        correlation_id: impl Into<CorrelationId>,
        predict: F,
    ) -> Result<Option<ClientSeq>>
    where
        F: FnOnce(&mut Value) -> std::result::Result<(), E>,
        E: fmt::Display,
    {
        let correlation_id = correlation_id.into();
        if correlation_id.trim().is_empty() {
            return Err(Error::MissingCorrelationId);
        }
        let target = target.into();
        let client_seq = self.ledger.next_client_seq();

        let before = self.optimistic.get(&target).cloned().unwrap_or(Value::Null);
        let mut after = before.clone();
        if let Err(e) = predict(&mut after) {
            self.report(SyncError::Produce {
                client_seq,
                target,
                message: e.to_string(),
            });
            return Ok(None);
        }

        let created_at = (self.clock)();
        let mutation = PendingMutation {
            client_seq,
            target_key: target.clone(),
            correlation_id,
            patch: patch::diff(&before, &after),
            inverse_patch: patch::diff(&after, &before),
            predicted_at_server_seq: self.confirmed_server_seq,
            created_at,
            deadline: self
                .config
                .timeouts_enabled()
                .then(|| created_at.saturating_add(self.config.mutation_timeout_ms)),
        };

        match self.ledger.register(mutation) {
            Registration::Registered | Registration::Duplicate => {}
            Registration::Evicted(evicted) => {
                self.report(SyncError::Pruning {
                    evicted: evicted.client_seq,
                    limit: self.ledger.max_pending(),
                });
                self.emit(&EngineEvent::RolledBack {
                    reason: RollbackReason::Evicted,
                    client_seqs: vec![evicted.client_seq],
                    inverse: vec![(evicted.target_key, evicted.inverse_patch)],
                });
            }
        }
        tracing::debug!(client_seq, target = %target, "mutation registered");

        self.recompute();
        self.notify(ChangeCause::MutationAdded(client_seq));

        // a failed replay clears the ledger
        Ok(self.ledger.contains(client_seq).then_some(client_seq))
    }

    /// Acknowledge a mutation. Does not advance the confirmed sequence;
    /// only deltas do that.
    pub fn confirm(&mut self, client_seq: ClientSeq, result: Option<&Value>) -> bool {
        if self.ledger.confirm(client_seq).is_none() {
            tracing::warn!(client_seq, "confirm for a mutation that is not pending");
            return false;
        }
        tracing::debug!(client_seq, result = ?result, "mutation confirmed");
        self.recompute();
        self.notify(ChangeCause::Confirmed(client_seq));
        true
    }

    /// Acknowledge the mutation sent under `correlation_id`.
    pub fn confirm_correlated(&mut self, correlation_id: &str, result: Option<&Value>) -> bool {
        match self.ledger.find_by_correlation(correlation_id) {
            Some(mutation) => {
                let client_seq = mutation.client_seq;
                self.confirm(client_seq, result)
            }
            None => {
                tracing::warn!(correlation_id, "ack for unknown correlation id");
                false
            }
        }
    }

    /// Reject a mutation and everything registered after it.
    pub fn reject(&mut self, client_seq: ClientSeq, reason: impl Into<String>) -> bool {
        self.roll_back(client_seq, RollbackReason::Rejected(reason.into()))
    }

    /// Reject the mutation sent under `correlation_id`.
    pub fn reject_correlated(&mut self, correlation_id: &str, reason: impl Into<String>) -> bool {
        match self.ledger.find_by_correlation(correlation_id) {
            Some(mutation) => {
                let client_seq = mutation.client_seq;
                self.reject(client_seq, reason)
            }
            None => {
                tracing::warn!(correlation_id, "rejection for unknown correlation id");
                false
            }
        }
    }

    /// Time out a mutation, if it is still pending.
    pub fn handle_timeout(&mut self, client_seq: ClientSeq) -> bool {
        if !self.ledger.contains(client_seq) {
            tracing::debug!(client_seq, "timeout for settled mutation ignored");
            return false;
        }
        self.roll_back(client_seq, RollbackReason::TimedOut)
    }

    /// Time out every mutation whose deadline has passed at `now`.
    /// Returns the mutations whose timeout fired.
    pub fn expire_timeouts(&mut self, now: Timestamp) -> Vec<ClientSeq> {
        self.ledger
            .expired(now)
            .into_iter()
            .filter(|&client_seq| self.handle_timeout(client_seq))
            .collect()
    }

    fn roll_back(&mut self, client_seq: ClientSeq, reason: RollbackReason) -> bool {
        let removed = self.ledger.reject_from(client_seq);
        if removed.is_empty() {
            tracing::warn!(client_seq, "rejection for a mutation that is not pending");
            return false;
        }

        let client_seqs: Vec<ClientSeq> = removed.iter().map(|m| m.client_seq).collect();
        let inverse = removed
            .into_iter()
            .map(|m| (m.target_key, m.inverse_patch))
            .collect();

        self.report(match &reason {
            RollbackReason::Rejected(why) => SyncError::Rejection {
                client_seq,
                reason: why.clone(),
                rolled_back: client_seqs.clone(),
            },
            RollbackReason::TimedOut => SyncError::Timeout {
                client_seq,
                rolled_back: client_seqs.clone(),
            },
        });
        self.emit(&EngineEvent::RolledBack {
            reason,
            client_seqs,
            inverse,
        });

        self.recompute();
        self.notify(ChangeCause::RolledBack(client_seq));
        true
    }

    // ------------------------------------------------------------------
    // Deltas
    // ------------------------------------------------------------------

    /// Fold one authoritative delta into confirmed state.
    pub fn apply_delta(&mut self, delta: Delta) -> DeltaOutcome {
        let server_seq = delta.server_seq;
        if server_seq <= self.confirmed_server_seq {
            tracing::debug!(
                server_seq,
                confirmed = self.confirmed_server_seq,
                "discarding stale delta"
            );
            return DeltaOutcome::Stale;
        }
        if let Some(prev) = delta.prev_server_seq {
            if prev != self.confirmed_server_seq {
                return self.handle_gap(&delta.target_key, prev, server_seq);
            }
        }

        let target = delta.target_key;
        let server_patch = delta.body.to_patch();

        let conflicting: Vec<&PendingMutation> = self
            .ledger
            .entries_predicted_before(server_seq)
            .into_iter()
            .filter(|m| m.target_key == target)
            .collect();
        let conflicting_seqs: Vec<ClientSeq> = conflicting.iter().map(|m| m.client_seq).collect();

        let (to_apply, resolution) = if conflicting.is_empty() {
            (server_patch, None)
        } else {
            let client_patch = Patch::concat(conflicting.iter().map(|m| &m.patch));
            let resolution = resolve(&client_patch, &server_patch, &self.config.conflict_strategy);
            tracing::info!(
                server_seq,
                target = %target,
                client_seqs = ?conflicting_seqs,
                outcome = ?resolution.outcome,
                "resolved conflict"
            );
            if let Some(message) = &resolution.error {
                self.report(SyncError::ConflictResolution {
                    target: target.clone(),
                    server_seq,
                    client_seqs: conflicting_seqs.clone(),
                    message: message.clone(),
                });
            }
            (resolution.patch, Some(resolution.outcome))
        };

        let base = self.confirmed.get(&target).cloned().unwrap_or(Value::Null);
        let Some(next) = (self.applicator)(&base, &to_apply) else {
            self.report(SyncError::ApplyDelta { server_seq, target });
            return DeltaOutcome::ApplyFailed;
        };

        let mut confirmed = self.confirmed.as_ref().clone();
        confirmed.insert(target.clone(), next);
        self.confirmed = Arc::new(confirmed);
        self.confirmed_server_seq = server_seq;
        self.streams.insert(target.clone(), StreamStatus::Synced);

        if matches!(resolution, Some(outcome) if outcome != ResolutionOutcome::ServerApplied) {
            self.ledger.remove_many(&conflicting_seqs);
        }
        if let Some(client_seq) = delta.originating_client_seq {
            if self.ledger.contains(client_seq) {
                self.ledger.confirm(client_seq);
                tracing::debug!(client_seq, server_seq, "delta acknowledged mutation");
            }
        }
        tracing::info!(server_seq, target = %target, "delta applied");

        self.recompute();
        self.notify(ChangeCause::DeltaApplied(server_seq));
        DeltaOutcome::Applied { resolution }
    }

    /// Apply deltas in order; each is its own operation.
    pub fn apply_deltas(&mut self, deltas: impl IntoIterator<Item = Delta>) -> Vec<DeltaOutcome> {
        deltas
            .into_iter()
            .map(|delta| self.apply_delta(delta))
            .collect()
    }

    fn handle_gap(&mut self, stream: &str, prev: ServerSeq, server_seq: ServerSeq) -> DeltaOutcome {
        let from = self.confirmed_server_seq + 1;
        let to = server_seq;

        if let StreamStatus::GapPending { to: requested, .. } = self.stream_status(stream) {
            if requested >= to {
                tracing::debug!(stream, server_seq, "gap already requested, dropping delta");
                return DeltaOutcome::Gap { from, to };
            }
        }

        self.streams
            .insert(stream.to_string(), StreamStatus::GapPending { from, to });
        match &self.request_missing_range {
            Some(request) => request(stream, from, to),
            None => tracing::warn!(stream, "no range requester configured; stream stalls"),
        }
        self.report(SyncError::GapRequest {
            stream: stream.to_string(),
            expected: self.confirmed_server_seq,
            received: prev,
            from,
            to,
        });
        DeltaOutcome::Gap { from, to }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Rebuild optimistic state from confirmed state and the ledger.
    ///
    /// If a replay fails the ledger can no longer be trusted: it is
    /// cleared and optimistic state snaps back to confirmed.
    fn recompute(&mut self) {
        let mut optimistic = self.confirmed.as_ref().clone();
        for (target, pending) in self.ledger.snapshot_patches_by_target() {
            if pending.is_empty() {
                continue;
            }
            let slot = optimistic.entry(target.clone()).or_insert(Value::Null);
            if let Err(cause) = patch::apply(slot, &pending) {
                let dropped = self.ledger.clear();
                self.optimistic = Arc::new(self.confirmed.as_ref().clone());
                self.report(SyncError::Recomputation {
                    target,
                    cause,
                    dropped,
                });
                return;
            }
        }
        self.optimistic = Arc::new(optimistic);
    }

    fn notify(&mut self, cause: ChangeCause) {
        let event = EngineEvent::Changed {
            optimistic: Arc::clone(&self.optimistic),
            confirmed_server_seq: self.confirmed_server_seq,
            cause,
        };
        self.emit(&event);
    }

    fn emit(&mut self, event: &EngineEvent) {
        for listener in self.listeners.values_mut() {
            listener(event);
        }
    }

    fn report(&self, error: SyncError) {
        tracing::warn!(kind = ?error.kind(), "{}", error);
        if let Some(sink) = &self.on_error {
            sink(&error);
        }
    }
}
