//! Simulation settings loaded from environment variables.

use foresight_engine::{ConfigError, EngineConfig};
use std::env;

/// Engine timeout used when `FORESIGHT_MUTATION_TIMEOUT_MS` is unset.
/// Lost acks should surface within a short run.
pub const DEFAULT_SIM_TIMEOUT_MS: u64 = 1_000;

/// Simulation configuration.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Engine settings (`FORESIGHT_*` variables)
    pub engine: EngineConfig,
    /// Number of client mutations to issue
    pub rounds: u64,
    /// Drop every n-th delivered delta; 0 disables
    pub drop_every: u64,
    /// Reject every n-th client mutation; 0 disables
    pub reject_every: u64,
    /// Issue a concurrent peer write every n rounds; 0 disables
    pub peer_every: u64,
    /// Never answer every n-th mutation, so it times out; 0 disables
    pub lose_every: u64,
    /// Simulated round-trip latency
    pub latency_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default().with_mutation_timeout_ms(DEFAULT_SIM_TIMEOUT_MS),
            rounds: 40,
            drop_every: 7,
            reject_every: 5,
            peer_every: 3,
            lose_every: 11,
            latency_ms: 20,
        }
    }
}

impl SimConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut engine = EngineConfig::from_lookup(&lookup)?;
        if lookup("FORESIGHT_MUTATION_TIMEOUT_MS").is_none() {
            engine.mutation_timeout_ms = DEFAULT_SIM_TIMEOUT_MS;
        }

        let number = |var: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(var) {
                Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
                    var,
                    value: raw.clone(),
                }),
                None => Ok(default),
            }
        };

        Ok(Self {
            engine,
            rounds: number("SIM_ROUNDS", defaults.rounds)?,
            drop_every: number("SIM_DROP_EVERY", defaults.drop_every)?,
            reject_every: number("SIM_REJECT_EVERY", defaults.reject_every)?,
            peer_every: number("SIM_PEER_EVERY", defaults.peer_every)?,
            lose_every: number("SIM_LOSE_EVERY", defaults.lose_every)?,
            latency_ms: number("SIM_LATENCY_MS", defaults.latency_ms)?,
        })
    }
}

/// Whether a 1-based counter hits an every-n schedule.
pub fn every(n: u64, counter: u64) -> bool {
    n > 0 && counter % n == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_shorten_engine_timeout() {
        let config = SimConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.engine.mutation_timeout_ms, DEFAULT_SIM_TIMEOUT_MS);
        assert_eq!(config.rounds, 40);
    }

    #[test]
    fn engine_vars_pass_through() {
        let config = SimConfig::from_lookup(|name| match name {
            "FORESIGHT_MUTATION_TIMEOUT_MS" => Some("0".into()),
            "FORESIGHT_CONFLICT_STRATEGY" => Some("client-wins".into()),
            "SIM_ROUNDS" => Some("3".into()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.engine.mutation_timeout_ms, 0);
        assert_eq!(config.engine.conflict_strategy.name(), "client-wins");
        assert_eq!(config.rounds, 3);
    }

    #[test]
    fn invalid_number() {
        let err = SimConfig::from_lookup(|name| (name == "SIM_DROP_EVERY").then(|| "often".into()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                var: "SIM_DROP_EVERY",
                value: "often".into()
            }
        );
    }

    #[test]
    fn every_schedule() {
        assert!(!every(0, 5));
        assert!(every(5, 5));
        assert!(!every(5, 6));
    }
}
