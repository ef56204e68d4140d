//! Authoritative deltas streamed from the server.

use crate::{codec, ClientSeq, Patch, ResolutionOutcome, ServerSeq, TargetKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum DeltaBody {
    /// Full replacement of the target slice
    Snapshot(Value),
    /// Incremental change
    Patch(Patch),
}

impl DeltaBody {
    /// Build a patch body from raw RFC 6902 JSON.
    pub fn from_json_patch(raw: &Value) -> Self {
        DeltaBody::Patch(codec::parse_json_patch(raw))
    }

    /// The body as a patch; a snapshot becomes a root replace.
    pub fn to_patch(&self) -> Patch {
        match self {
            DeltaBody::Snapshot(value) => Patch::replace_root(value.clone()),
            DeltaBody::Patch(patch) => patch.clone(),
        }
    }
}

/// An authoritative change plus its sequence metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    /// Sequence number the server assigned to this delta
    pub server_seq: ServerSeq,
    /// Sequence the sender believes the receiver holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_server_seq: Option<ServerSeq>,
    /// State slice this delta changes
    pub target_key: TargetKey,
    /// The change itself
    pub body: DeltaBody,
    /// Set when this delta is the echo of one of our mutations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originating_client_seq: Option<ClientSeq>,
}

impl Delta {
    /// Create a patch delta.
    pub fn patch(server_seq: ServerSeq, target_key: impl Into<TargetKey>, patch: Patch) -> Self {
        Self {
            server_seq,
            prev_server_seq: None,
            target_key: target_key.into(),
            body: DeltaBody::Patch(patch),
            originating_client_seq: None,
        }
    }

    /// Create a snapshot delta.
    pub fn snapshot(server_seq: ServerSeq, target_key: impl Into<TargetKey>, value: Value) -> Self {
        Self {
            server_seq,
            prev_server_seq: None,
            target_key: target_key.into(),
            body: DeltaBody::Snapshot(value),
            originating_client_seq: None,
        }
    }

    /// Set the sequence this delta was built on.
    pub fn with_prev(mut self, prev_server_seq: ServerSeq) -> Self {
        self.prev_server_seq = Some(prev_server_seq);
        self
    }

    /// Mark this delta as the echo of a pending mutation.
    pub fn acknowledging(mut self, client_seq: ClientSeq) -> Self {
        self.originating_client_seq = Some(client_seq);
        self
    }
}

/// What happened to a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeltaOutcome {
    /// Folded into confirmed state. `resolution` is set when it conflicted
    /// with pending mutations.
    Applied {
        resolution: Option<ResolutionOutcome>,
    },
    /// Already covered by confirmed state; discarded
    Stale,
    /// Not contiguous with confirmed state; discarded, range `from..=to`
    /// requested
    Gap { from: ServerSeq, to: ServerSeq },
    /// The applicator failed; discarded
    ApplyFailed,
}

impl DeltaOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, DeltaOutcome::Applied { .. })
    }
}
