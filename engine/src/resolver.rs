//! Conflict resolution between a local combined patch and a server patch.
//!
//! [`resolve`] is pure: it borrows both patches, never mutates them, and
//! falls back to server authority whenever a custom merge fails.

use crate::Patch;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Caller-supplied merge: `(client, server) -> merged`.
pub type CustomResolver =
    Arc<dyn Fn(&Patch, &Patch) -> std::result::Result<Patch, String> + Send + Sync>;

/// Strategy for resolving a conflict.
#[derive(Clone, Default)]
pub enum ConflictStrategy {
    /// Server patch is applied; local predictions stay pending (default)
    #[default]
    ServerWins,
    /// Local patch is folded into confirmed state
    ClientWins,
    /// Caller merges both patches
    Custom(CustomResolver),
}

impl ConflictStrategy {
    /// Wrap a merge function.
    pub fn custom<F>(merge: F) -> Self
    where
        F: Fn(&Patch, &Patch) -> std::result::Result<Patch, String> + Send + Sync + 'static,
    {
        ConflictStrategy::Custom(Arc::new(merge))
    }

    /// Stable name, as used in configuration.
    pub fn name(&self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server-wins",
            ConflictStrategy::ClientWins => "client-wins",
            ConflictStrategy::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::ServerWins => write!(f, "ServerWins"),
            ConflictStrategy::ClientWins => write!(f, "ClientWins"),
            ConflictStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionOutcome {
    /// Server patch won
    ServerApplied,
    /// Local patch won
    ClientApplied,
    /// Custom merge produced a new patch
    Merged,
    /// Custom merge failed; server patch applied
    Error,
}

/// Result of resolving a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The patch to apply to confirmed state
    pub patch: Patch,
    /// How it was chosen
    pub outcome: ResolutionOutcome,
    /// Failure message from a custom merge
    pub error: Option<String>,
}

impl Resolution {
    fn new(patch: &Patch, outcome: ResolutionOutcome) -> Self {
        Self {
            patch: patch.clone(),
            outcome,
            error: None,
        }
    }
}

/// Resolve `client` against `server` under `strategy`.
pub fn resolve(client: &Patch, server: &Patch, strategy: &ConflictStrategy) -> Resolution {
    if client.is_empty() {
        return Resolution::new(server, ResolutionOutcome::ServerApplied);
    }
    if server.is_empty() {
        return Resolution::new(client, ResolutionOutcome::ClientApplied);
    }
    match strategy {
        ConflictStrategy::ServerWins => Resolution::new(server, ResolutionOutcome::ServerApplied),
        ConflictStrategy::ClientWins => Resolution::new(client, ResolutionOutcome::ClientApplied),
        ConflictStrategy::Custom(merge) => match run_merge(merge, client, server) {
            Ok(merged) => Resolution {
                patch: merged,
                outcome: ResolutionOutcome::Merged,
                error: None,
            },
            Err(message) => Resolution {
                patch: server.clone(),
                outcome: ResolutionOutcome::Error,
                error: Some(message),
            },
        },
    }
}

/// Call a custom merge, turning a panic into an error message.
fn run_merge(
    merge: &CustomResolver,
    client: &Patch,
    server: &Patch,
) -> std::result::Result<Patch, String> {
    panic::catch_unwind(AssertUnwindSafe(|| merge(client, server)))
        .unwrap_or_else(|payload| Err(panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("custom resolver panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("custom resolver panicked: {}", message)
    } else {
        "custom resolver panicked".to_string()
    }
}
