//! The simulation loop.
//!
//! One client (a [`SharedEngine`]) and one [`Authority`] exchange mutations
//! and deltas through a lossy, delayed channel. Gap requests from the engine
//! travel back over an mpsc channel and are answered from authority history.

use crate::authority::Authority;
use crate::config::{every, SimConfig};
use crate::error::SimError;
use foresight_engine::{Delta, Engine, ServerSeq, SharedEngine, StateMap};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const TARGET: &str = "todos";

type GapRequest = (String, ServerSeq, ServerSeq);

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub rounds: u64,
    pub authority_seq: ServerSeq,
    pub confirmed_seq: ServerSeq,
    pub pending: usize,
    /// Client confirmed state equals authority state
    pub converged: bool,
    pub dropped_deltas: u64,
    pub rejected: u64,
    pub lost: u64,
    pub gap_requests: u64,
    /// Reported engine errors by kind
    pub errors: BTreeMap<String, usize>,
}

struct Link {
    client: SharedEngine,
    gaps: mpsc::UnboundedReceiver<GapRequest>,
    drop_every: u64,
    delivered: u64,
    dropped: u64,
    gap_requests: u64,
}

impl Link {
    /// Deliver a live delta, unless the schedule says it gets lost.
    fn deliver(&mut self, delta: Delta) {
        self.delivered += 1;
        if every(self.drop_every, self.delivered) {
            self.dropped += 1;
            tracing::info!(server_seq = delta.server_seq, "dropping delta in transit");
            return;
        }
        let outcome = self.client.apply_delta(delta);
        tracing::debug!(?outcome, "delta delivered");
    }

    /// Answer every outstanding gap request from authority history.
    fn answer_gaps(&mut self, authority: &Authority) {
        while let Ok((stream, from, to)) = self.gaps.try_recv() {
            self.gap_requests += 1;
            let deltas = authority.range(from, to);
            tracing::info!(%stream, from, to, count = deltas.len(), "re-delivering range");
            self.client.apply_deltas(deltas);
        }
    }
}

/// Run the simulation to completion.
pub async fn run(config: SimConfig) -> Result<Report, SimError> {
    let initial: StateMap = [(TARGET.to_string(), json!([]))].into_iter().collect();
    let errors: Arc<Mutex<BTreeMap<String, usize>>> = Arc::default();
    let (gap_tx, gap_rx) = mpsc::unbounded_channel::<GapRequest>();

    let error_counts = Arc::clone(&errors);
    let engine = Engine::builder(config.engine.clone())
        .initial_state(initial.clone())
        .request_missing_range(move |stream, from, to| {
            let _ = gap_tx.send((stream.to_string(), from, to));
        })
        .on_error(move |e| {
            let mut counts = error_counts.lock().unwrap_or_else(PoisonError::into_inner);
            *counts.entry(format!("{:?}", e.kind())).or_default() += 1;
        })
        .build();

    let mut link = Link {
        client: SharedEngine::new(engine),
        gaps: gap_rx,
        drop_every: config.drop_every,
        delivered: 0,
        dropped: 0,
        gap_requests: 0,
    };
    let mut authority = Authority::new(initial);
    let latency = Duration::from_millis(config.latency_ms);
    let (mut rejected, mut lost) = (0u64, 0u64);

    for round in 1..=config.rounds {
        if every(config.peer_every, round) {
            let delta = authority.peer_write(TARGET, |todos| {
                if let Some(first) = todos.get_mut(0) {
                    first["done"] = json!(!first["done"].as_bool().unwrap_or(false));
                }
            })?;
            link.deliver(delta);
        }

        let correlation_id = Uuid::new_v4().to_string();
        let title = format!("todo {}", round);
        let registered = link
            .client
            .add_mutation(TARGET, correlation_id.clone(), |todos| {
                let list = todos.as_array_mut().ok_or("todos is not a list")?;
                list.push(json!({"id": correlation_id, "title": title, "done": false}));
                Ok::<(), &str>(())
            })?;
        let Some(client_seq) = registered else {
            continue;
        };
        let Some(patch) = link.client.read(|engine| {
            engine
                .pending_mutations()
                .iter()
                .find(|m| m.client_seq == client_seq)
                .map(|m| m.patch.clone())
        }) else {
            continue;
        };

        tokio::time::sleep(latency).await;

        if every(config.lose_every, round) {
            lost += 1;
            tracing::info!(client_seq, "mutation lost, waiting for timeout");
        } else if every(config.reject_every, round) {
            rejected += 1;
            link.client
                .reject_correlated(&correlation_id, "rejected by authority");
        } else {
            match authority.submit(TARGET, &patch, client_seq) {
                Ok(delta) => link.deliver(delta),
                Err(SimError::Rejected(reason)) => {
                    rejected += 1;
                    link.client.reject_correlated(&correlation_id, reason);
                }
                Err(e) => return Err(e),
            }
        }

        link.answer_gaps(&authority);
    }

    if lost > 0 && config.engine.timeouts_enabled() {
        tokio::time::sleep(Duration::from_millis(config.engine.mutation_timeout_ms + 50)).await;
    }

    // the last delta may have been dropped with nothing after it to reveal the gap
    let confirmed = link.client.read(Engine::confirmed_server_seq);
    if confirmed < authority.seq() {
        link.client
            .apply_deltas(authority.range(confirmed + 1, authority.seq()));
    }
    link.answer_gaps(&authority);

    let confirmed_state = link.client.confirmed_state();
    let errors = errors
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    Ok(Report {
        rounds: config.rounds,
        authority_seq: authority.seq(),
        confirmed_seq: link.client.read(Engine::confirmed_server_seq),
        pending: link.client.read(|engine| engine.pending_mutations().len()),
        converged: confirmed_state.as_ref() == authority.state(),
        dropped_deltas: link.dropped,
        rejected,
        lost,
        gap_requests: link.gap_requests,
        errors,
    })
}
