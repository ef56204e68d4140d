//! Foresight Sim - drives the optimistic engine against a simulated server.
//!
//! The link between client and authority drops deltas, rejects writes and
//! loses acknowledgements on a configurable schedule, exercising gap
//! recovery, rollback and timeouts end to end.

mod authority;
mod config;
mod driver;
mod error;

use crate::config::SimConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env before the filter reads RUST_LOG
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foresight_engine=debug,foresight_sim=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SimConfig::from_env()?;
    tracing::info!(
        rounds = config.rounds,
        strategy = config.engine.conflict_strategy.name(),
        timeout_ms = config.engine.mutation_timeout_ms,
        "Starting simulation"
    );

    let report = driver::run(config).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.converged {
        tracing::info!(server_seq = report.confirmed_seq, "client converged with authority");
    } else {
        tracing::warn!(
            confirmed_seq = report.confirmed_seq,
            authority_seq = report.authority_seq,
            "client diverged from authority"
        );
    }

    Ok(())
}
