//! Error types for the Foresight engine.
//!
//! [`Error`] is returned from fallible calls (patch application, pointer
//! parsing, the one engine precondition). [`SyncError`] is never returned:
//! the engine reports it through the `on_error` sink and keeps going.

use crate::{ClientSeq, ServerSeq, StreamId, TargetKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors returned by the engine's fallible APIs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Engine preconditions
    #[error("mutation registered without a correlation id")]
    MissingCorrelationId,

    // Pointer errors
    #[error("invalid JSON pointer '{pointer}': {reason}")]
    InvalidPointer { pointer: String, reason: String },

    // Patch application errors
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("cannot address a child of a scalar at {0}")]
    InvalidTarget(String),

    #[error("invalid array index '{index}' at {path}")]
    InvalidIndex { path: String, index: String },

    #[error("patch operation '{op}' is missing '{field}'")]
    MissingField { op: String, field: String },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of reported failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Produce,
    ApplyDelta,
    ConflictResolution,
    Recomputation,
    Timeout,
    Rejection,
    GapRequest,
    Pruning,
}

/// A non-fatal failure delivered to the `on_error` sink.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("predicted change {client_seq} on '{target}' failed: {message}")]
    Produce {
        client_seq: ClientSeq,
        target: TargetKey,
        message: String,
    },

    #[error("delta {server_seq} on '{target}' could not be applied")]
    ApplyDelta {
        server_seq: ServerSeq,
        target: TargetKey,
    },

    #[error("conflict on '{target}' at delta {server_seq} with mutations {client_seqs:?}: {message}")]
    ConflictResolution {
        target: TargetKey,
        server_seq: ServerSeq,
        client_seqs: Vec<ClientSeq>,
        message: String,
    },

    #[error("replaying pending mutations on '{target}' failed ({cause}); dropped {dropped} mutations")]
    Recomputation {
        target: TargetKey,
        cause: Error,
        dropped: usize,
    },

    #[error("mutation {client_seq} timed out; rolled back {rolled_back:?}")]
    Timeout {
        client_seq: ClientSeq,
        rolled_back: Vec<ClientSeq>,
    },

    #[error("mutation {client_seq} rejected ({reason}); rolled back {rolled_back:?}")]
    Rejection {
        client_seq: ClientSeq,
        reason: String,
        rolled_back: Vec<ClientSeq>,
    },

    #[error("gap on stream '{stream}': holding {expected}, delta built on {received}; requested {from}..={to}")]
    GapRequest {
        stream: StreamId,
        expected: ServerSeq,
        received: ServerSeq,
        from: ServerSeq,
        to: ServerSeq,
    },

    #[error("ledger exceeded {limit} pending mutations; evicted mutation {evicted}")]
    Pruning { evicted: ClientSeq, limit: usize },
}

impl SyncError {
    /// The class of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Produce { .. } => ErrorKind::Produce,
            SyncError::ApplyDelta { .. } => ErrorKind::ApplyDelta,
            SyncError::ConflictResolution { .. } => ErrorKind::ConflictResolution,
            SyncError::Recomputation { .. } => ErrorKind::Recomputation,
            SyncError::Timeout { .. } => ErrorKind::Timeout,
            SyncError::Rejection { .. } => ErrorKind::Rejection,
            SyncError::GapRequest { .. } => ErrorKind::GapRequest,
            SyncError::Pruning { .. } => ErrorKind::Pruning,
        }
    }
}
