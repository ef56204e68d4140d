//! Engine configuration.

use crate::{ConflictStrategy, ServerSeq};
use std::env;

pub const DEFAULT_MAX_PENDING_MUTATIONS: usize = 50;
pub const DEFAULT_MUTATION_TIMEOUT_MS: u64 = 15_000;

/// Tunables for an [`crate::Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Server sequence the confirmed state corresponds to at startup
    pub initial_server_seq: ServerSeq,
    /// How conflicts between pending mutations and deltas are resolved
    pub conflict_strategy: ConflictStrategy,
    /// Ledger capacity; the oldest mutation is evicted past this
    pub max_pending_mutations: usize,
    /// Mutation timeout in milliseconds; 0 disables timeouts
    pub mutation_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_server_seq: 0,
            conflict_strategy: ConflictStrategy::ServerWins,
            max_pending_mutations: DEFAULT_MAX_PENDING_MUTATIONS,
            mutation_timeout_ms: DEFAULT_MUTATION_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    pub fn with_initial_server_seq(mut self, seq: ServerSeq) -> Self {
        self.initial_server_seq = seq;
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_max_pending_mutations(mut self, max: usize) -> Self {
        self.max_pending_mutations = max;
        self
    }

    pub fn with_mutation_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.mutation_timeout_ms = timeout_ms;
        self
    }

    /// Whether mutations get a deadline.
    pub fn timeouts_enabled(&self) -> bool {
        self.mutation_timeout_ms > 0
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults:
    /// - `FORESIGHT_INITIAL_SERVER_SEQ`
    /// - `FORESIGHT_CONFLICT_STRATEGY` (`server-wins` | `client-wins`)
    /// - `FORESIGHT_MAX_PENDING`
    /// - `FORESIGHT_MUTATION_TIMEOUT_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("FORESIGHT_INITIAL_SERVER_SEQ") {
            config.initial_server_seq = parse_number("FORESIGHT_INITIAL_SERVER_SEQ", &raw)?;
        }
        if let Some(raw) = lookup("FORESIGHT_CONFLICT_STRATEGY") {
            config.conflict_strategy = parse_strategy(&raw)?;
        }
        if let Some(raw) = lookup("FORESIGHT_MAX_PENDING") {
            config.max_pending_mutations = parse_number("FORESIGHT_MAX_PENDING", &raw)?;
        }
        if let Some(raw) = lookup("FORESIGHT_MUTATION_TIMEOUT_MS") {
            config.mutation_timeout_ms = parse_number("FORESIGHT_MUTATION_TIMEOUT_MS", &raw)?;
        }

        Ok(config)
    }
}

/// Parse a strategy name. Custom strategies can only be set in code.
pub fn parse_strategy(raw: &str) -> Result<ConflictStrategy, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "server-wins" | "server_wins" | "serverwins" => Ok(ConflictStrategy::ServerWins),
        "client-wins" | "client_wins" | "clientwins" => Ok(ConflictStrategy::ClientWins),
        _ => Err(ConfigError::UnknownStrategy(raw.to_string())),
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: raw.to_string(),
    })
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },

    #[error("unknown conflict strategy '{0}' (expected server-wins or client-wins)")]
    UnknownStrategy(String),
}
