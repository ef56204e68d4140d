//! Simulator errors.

use foresight_engine::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] foresight_engine::Error),

    /// The authority refused a write; the client should roll it back.
    #[error("Write rejected: {0}")]
    Rejected(String),
}
