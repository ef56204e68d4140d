//! # Foresight Engine
//!
//! An optimistic synchronization engine for client applications.
//!
//! The caller applies a predicted change immediately, before the server has
//! confirmed it. The engine keeps that speculative change in a ledger and
//! reconciles it against the authoritative, sequence-numbered deltas the
//! server streams back.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never talks to a network. Gap recovery and delta
//!   application are caller-supplied callbacks.
//! - **Synchronous core**: every operation runs to completion before it
//!   returns. Only [`SharedEngine`] adds timers on top.
//! - **Degrade, don't crash**: failures are reported through an error sink
//!   and the engine always stays queryable.
//!
//! ## Core Concepts
//!
//! ### State
//!
//! State is a set of independent JSON slices keyed by target
//! ([`StateMap`]). The engine keeps two views of it:
//! - *confirmed*: built only from applied server deltas
//! - *optimistic*: confirmed plus every pending mutation, replayed in order
//!
//! ### Patches
//!
//! Changes are expressed as [`Patch`]es: ordered add/replace/remove (and
//! move/copy) operations over a JSON tree. The [`codec`] module converts
//! them to and from RFC 6902 JSON Patch.
//!
//! ### Conflicts
//!
//! A pending mutation predicted before an incoming delta's sequence number
//! conflicts with it. The [`ConflictStrategy`] decides who wins:
//! - [`ConflictStrategy::ServerWins`] - server patch applies, local
//!   predictions are replayed on top (default)
//! - [`ConflictStrategy::ClientWins`] - local patch is folded into the
//!   confirmed state
//! - [`ConflictStrategy::Custom`] - caller merges the two patches
//!
//! ## Quick Start
//!
//! ```rust
//! use foresight_engine::{Delta, Engine, EngineConfig, Patch, PatchOp, PathSegment};
//! use serde_json::json;
//!
//! let mut engine = Engine::builder(EngineConfig::default())
//!     .state("todo", json!({"title": "draft"}))
//!     .build();
//!
//! // Predict a local change right away.
//! let seq = engine
//!     .add_mutation("todo", "msg-1", |todo| {
//!         todo["title"] = json!("final");
//!         Ok::<(), String>(())
//!     })
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(engine.optimistic("todo").unwrap()["title"], "final");
//! assert_eq!(engine.confirmed("todo").unwrap()["title"], "draft");
//!
//! // The server echoes it back as delta 1.
//! let patch = Patch::from_ops(vec![PatchOp::replace(
//!     vec![PathSegment::key("title")],
//!     json!("final"),
//! )]);
//! engine.apply_delta(Delta::patch(1, "todo", patch).with_prev(0).acknowledging(seq));
//!
//! assert!(engine.pending_mutations().is_empty());
//! assert_eq!(engine.confirmed_server_seq(), 1);
//! ```

pub mod codec;
pub mod config;
pub mod delta;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod patch;
pub mod resolver;
pub mod runtime;

// Re-export main types at crate root
pub use codec::JsonPatchOp;
pub use config::{ConfigError, EngineConfig};
pub use delta::{Delta, DeltaBody, DeltaOutcome};
pub use engine::{
    ChangeCause, Engine, EngineBuilder, EngineEvent, RollbackReason, StreamStatus,
    SubscriptionId,
};
pub use error::{Error, ErrorKind, SyncError};
pub use ledger::{MutationLedger, PendingMutation, Registration};
pub use patch::{OpKind, PathSegment, Patch, PatchOp};
pub use resolver::{resolve, ConflictStrategy, Resolution, ResolutionOutcome};
pub use runtime::SharedEngine;

use std::collections::BTreeMap;

/// Type aliases for clarity
pub type TargetKey = String;
pub type StreamId = String;
pub type CorrelationId = String;
pub type ClientSeq = u64;
pub type ServerSeq = u64;
pub type Timestamp = u64;

/// Every state slice the engine holds, keyed by target.
pub type StateMap = BTreeMap<TargetKey, serde_json::Value>;
