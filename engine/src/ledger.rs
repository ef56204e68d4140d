//! The mutation ledger: speculative changes waiting for the server.
//!
//! Entries are kept sorted by `client_seq`. Every entry remembers the
//! confirmed server sequence it was predicted against, which is what lets
//! the engine tell which pending work an incoming delta conflicts with.

use crate::{ClientSeq, CorrelationId, Patch, ServerSeq, TargetKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A speculative mutation awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    /// Local sequence number
    pub client_seq: ClientSeq,
    /// State slice this mutation changes
    pub target_key: TargetKey,
    /// Transport message id used for acks and rejections
    pub correlation_id: CorrelationId,
    /// Forward patch, relative to the optimistic state it was predicted on
    pub patch: Patch,
    /// Patch undoing `patch`
    pub inverse_patch: Patch,
    /// Confirmed server sequence at registration time
    pub predicted_at_server_seq: ServerSeq,
    /// When it was registered (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When it times out, if timeouts are enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Timestamp>,
}

impl PendingMutation {
    /// Whether this mutation is past its deadline at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Result of registering a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// Appended
    Registered,
    /// A mutation with this `client_seq` already exists; nothing changed
    Duplicate,
    /// Appended, and the oldest entry was evicted to stay within the limit
    Evicted(PendingMutation),
}

/// Ordered collection of pending mutations.
#[derive(Debug, Clone)]
pub struct MutationLedger {
    entries: Vec<PendingMutation>,
    last_seq: ClientSeq,
    max_pending: usize,
}

impl MutationLedger {
    /// Create an empty ledger holding at most `max_pending` entries.
    pub fn new(max_pending: usize) -> Self {
        Self {
            entries: Vec::new(),
            last_seq: 0,
            max_pending: max_pending.max(1),
        }
    }

    /// Allocate the next client sequence number, starting at 1.
    pub fn next_client_seq(&mut self) -> ClientSeq {
        self.last_seq += 1;
        self.last_seq
    }

    /// Maximum number of entries.
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Insert a mutation in `client_seq` order.
    pub fn register(&mut self, mutation: PendingMutation) -> Registration {
        let index = match self.position(mutation.client_seq) {
            Ok(_) => {
                tracing::warn!(
                    client_seq = mutation.client_seq,
                    "ignoring duplicate mutation registration"
                );
                return Registration::Duplicate;
            }
            Err(index) => index,
        };
        self.entries.insert(index, mutation);

        if self.entries.len() > self.max_pending {
            let evicted = self.entries.remove(0);
            tracing::warn!(
                client_seq = evicted.client_seq,
                limit = self.max_pending,
                "ledger full, evicting oldest mutation"
            );
            return Registration::Evicted(evicted);
        }
        Registration::Registered
    }

    /// Remove exactly the entry for `client_seq`.
    pub fn confirm(&mut self, client_seq: ClientSeq) -> Option<PendingMutation> {
        match self.position(client_seq) {
            Ok(index) => Some(self.entries.remove(index)),
            Err(_) => {
                tracing::debug!(client_seq, "confirm for unknown mutation ignored");
                None
            }
        }
    }

    /// Remove the entry for `client_seq` and every later entry.
    ///
    /// Later mutations may have been predicted on top of the failed one, so
    /// they go too. Returned most recent first, which is undo order.
    pub fn reject_from(&mut self, client_seq: ClientSeq) -> Vec<PendingMutation> {
        let Ok(index) = self.position(client_seq) else {
            tracing::debug!(client_seq, "reject for unknown mutation ignored");
            return Vec::new();
        };
        let mut removed = self.entries.split_off(index);
        removed.reverse();
        removed
    }

    /// Remove every listed entry that is still present.
    pub fn remove_many(&mut self, client_seqs: &[ClientSeq]) -> Vec<PendingMutation> {
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            if client_seqs.contains(&entry.client_seq) {
                removed.push(entry.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Entries predicted against a server sequence older than `server_seq`.
    pub fn entries_predicted_before(&self, server_seq: ServerSeq) -> Vec<&PendingMutation> {
        self.entries
            .iter()
            .filter(|entry| entry.predicted_at_server_seq < server_seq)
            .collect()
    }

    /// Per target, every pending patch concatenated in ledger order.
    pub fn snapshot_patches_by_target(&self) -> BTreeMap<TargetKey, Patch> {
        let mut by_target: BTreeMap<TargetKey, Patch> = BTreeMap::new();
        for entry in &self.entries {
            by_target
                .entry(entry.target_key.clone())
                .or_default()
                .extend(&entry.patch);
        }
        by_target
    }

    /// Entries whose deadline has passed at `now`, in ledger order.
    pub fn expired(&self, now: Timestamp) -> Vec<ClientSeq> {
        self.entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.client_seq)
            .collect()
    }

    /// Find the entry registered under a transport correlation id.
    pub fn find_by_correlation(&self, correlation_id: &str) -> Option<&PendingMutation> {
        self.entries
            .iter()
            .find(|entry| entry.correlation_id == correlation_id)
    }

    pub fn get(&self, client_seq: ClientSeq) -> Option<&PendingMutation> {
        self.position(client_seq).ok().map(|index| &self.entries[index])
    }

    pub fn contains(&self, client_seq: ClientSeq) -> bool {
        self.position(client_seq).is_ok()
    }

    pub fn entries(&self) -> &[PendingMutation] {
        &self.entries
    }

    /// Drop every entry. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, client_seq: ClientSeq) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by_key(&client_seq, |entry| entry.client_seq)
    }
}

impl Default for MutationLedger {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_PENDING_MUTATIONS)
    }
}
