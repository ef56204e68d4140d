//! End-to-end scenarios for foresight-engine
//!
//! Each test drives the public API the way a transport layer would:
//! predict locally, then feed server acks, rejections and deltas back in.

use foresight_engine::{
    codec, ChangeCause, ConflictStrategy, Delta, DeltaBody, DeltaOutcome, Engine, EngineConfig,
    EngineEvent, ErrorKind, Patch, PatchOp, PathSegment, ResolutionOutcome, RollbackReason,
    StreamStatus, SyncError,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

type Recorded<T> = Arc<Mutex<Vec<T>>>;

struct Harness {
    engine: Engine,
    errors: Recorded<SyncError>,
    gap_requests: Recorded<(String, u64, u64)>,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        let errors: Recorded<SyncError> = Arc::default();
        let gap_requests: Recorded<(String, u64, u64)> = Arc::default();
        let error_sink = Arc::clone(&errors);
        let gap_sink = Arc::clone(&gap_requests);

        let engine = Engine::builder(config)
            .state("items", json!([{"id": "1", "value": "initial"}]))
            .on_error(move |e| error_sink.lock().unwrap().push(e.clone()))
            .request_missing_range(move |stream, from, to| {
                gap_sink.lock().unwrap().push((stream.to_string(), from, to))
            })
            .build();

        Self {
            engine,
            errors,
            gap_requests,
        }
    }

    fn predict(&mut self, value: &str) -> u64 {
        let value = value.to_string();
        let correlation_id = format!("msg-{}", value);
        self.engine
            .add_mutation("items", correlation_id, move |items| {
                items[0]["value"] = json!(value);
                Ok::<(), String>(())
            })
            .unwrap()
            .unwrap()
    }

    fn optimistic_value(&self) -> Value {
        self.engine.optimistic("items").unwrap()[0]["value"].clone()
    }

    fn confirmed_value(&self) -> Value {
        self.engine.confirmed("items").unwrap()[0]["value"].clone()
    }

    fn pending(&self) -> Vec<u64> {
        self.engine
            .pending_mutations()
            .iter()
            .map(|m| m.client_seq)
            .collect()
    }

    fn error_kinds(&self) -> Vec<ErrorKind> {
        self.errors.lock().unwrap().iter().map(SyncError::kind).collect()
    }
}

fn set_value(value: &str) -> Patch {
    Patch::from_ops(vec![PatchOp::replace(
        vec![PathSegment::index(0), PathSegment::key("value")],
        json!(value),
    )])
}

fn server_delta(server_seq: u64, value: &str) -> Delta {
    Delta::patch(server_seq, "items", set_value(value)).with_prev(server_seq - 1)
}

// ============================================================================
// Optimistic Prediction
// ============================================================================

#[test]
fn prediction_is_visible_before_confirmation() {
    let mut h = Harness::new(EngineConfig::default());

    h.predict("optimistic");

    assert_eq!(h.optimistic_value(), "optimistic");
    assert_eq!(h.confirmed_value(), "initial");
    assert_eq!(h.engine.confirmed_server_seq(), 0);
}

#[test]
fn stacked_predictions_replay_in_order() {
    let mut h = Harness::new(EngineConfig::default());

    for i in 0..5 {
        let n = i;
        h.engine
            .add_mutation("items", format!("push-{}", n), move |items| {
                if let Some(list) = items.as_array_mut() {
                    list.push(json!({"id": format!("new-{}", n), "value": n}));
                }
                Ok::<(), String>(())
            })
            .unwrap();
    }

    let items = h.engine.optimistic("items").unwrap().as_array().unwrap().clone();
    assert_eq!(items.len(), 6);
    assert_eq!(items[5]["id"], "new-4");
    assert_eq!(h.engine.confirmed("items").unwrap().as_array().unwrap().len(), 1);
}

#[test]
fn pending_patch_exports_as_json_patch() {
    let mut h = Harness::new(EngineConfig::default());
    h.predict("optimistic");

    let mutation = &h.engine.pending_mutations()[0];
    assert_eq!(
        codec::to_json_value(&mutation.patch),
        json!([{"op": "replace", "path": "/0/value", "value": "optimistic"}])
    );
    assert_eq!(
        codec::to_json_value(&mutation.inverse_patch),
        json!([{"op": "replace", "path": "/0/value", "value": "initial"}])
    );
}

// ============================================================================
// Conflict Resolution
// ============================================================================

#[test]
fn server_wins_retains_pending_mutation() {
    let mut h = Harness::new(EngineConfig::default());
    h.predict("optimistic");

    let outcome = h.engine.apply_delta(server_delta(1, "server"));

    assert_eq!(
        outcome,
        DeltaOutcome::Applied {
            resolution: Some(ResolutionOutcome::ServerApplied)
        }
    );
    assert_eq!(h.confirmed_value(), "server");
    assert_eq!(h.pending(), vec![1]);
    assert_eq!(h.optimistic_value(), "optimistic");
}

#[test]
fn client_wins_removes_pending_mutation() {
    let mut h =
        Harness::new(EngineConfig::default().with_conflict_strategy(ConflictStrategy::ClientWins));
    h.predict("optimistic");

    let outcome = h.engine.apply_delta(server_delta(1, "server"));

    assert_eq!(
        outcome,
        DeltaOutcome::Applied {
            resolution: Some(ResolutionOutcome::ClientApplied)
        }
    );
    assert_eq!(h.confirmed_value(), "optimistic");
    assert!(h.pending().is_empty());
    assert_eq!(h.engine.optimistic_state(), h.engine.confirmed_state());
}

#[test]
fn custom_merge_layers_local_fields_over_server() {
    let strategy = ConflictStrategy::custom(|client, server| Ok(Patch::concat([server, client])));
    let mut h = Harness::new(EngineConfig::default().with_conflict_strategy(strategy));

    h.engine
        .add_mutation("items", "rename", |items| {
            items[0]["label"] = json!("mine");
            Ok::<(), String>(())
        })
        .unwrap();

    h.engine.apply_delta(server_delta(1, "server"));

    let confirmed = h.engine.confirmed("items").unwrap();
    assert_eq!(confirmed[0]["value"], "server");
    assert_eq!(confirmed[0]["label"], "mine");
    assert!(h.pending().is_empty());
}

#[test]
fn panicking_merge_degrades_to_server_patch() {
    let strategy = ConflictStrategy::custom(|_, _| panic!("merge is broken"));
    let mut h = Harness::new(EngineConfig::default().with_conflict_strategy(strategy));
    h.predict("mine");

    let outcome = h.engine.apply_delta(server_delta(1, "server"));

    assert_eq!(
        outcome,
        DeltaOutcome::Applied {
            resolution: Some(ResolutionOutcome::Error)
        }
    );
    assert_eq!(h.confirmed_value(), "server");
    assert_eq!(h.engine.confirmed_server_seq(), 1);
    assert_eq!(h.error_kinds(), vec![ErrorKind::ConflictResolution]);

    // the engine stays usable afterwards
    h.predict("again");
    assert_eq!(h.optimistic_value(), "again");
}

#[test]
fn conflict_only_covers_the_delta_target() {
    let mut h =
        Harness::new(EngineConfig::default().with_conflict_strategy(ConflictStrategy::ClientWins));
    h.engine
        .add_mutation("settings", "theme", |settings| {
            *settings = json!({"theme": "dark"});
            Ok::<(), String>(())
        })
        .unwrap();

    h.engine.apply_delta(server_delta(1, "server"));

    assert_eq!(h.confirmed_value(), "server");
    assert_eq!(h.pending().len(), 1);
    assert_eq!(h.engine.optimistic("settings"), Some(&json!({"theme": "dark"})));
}

// ============================================================================
// Sequencing & Gaps
// ============================================================================

#[test]
fn gap_requests_missing_range() {
    let mut h = Harness::new(EngineConfig::default().with_initial_server_seq(1));
    let before = h.engine.confirmed_state();

    let outcome = h
        .engine
        .apply_delta(Delta::patch(3, "items", set_value("three")).with_prev(2));

    assert_eq!(outcome, DeltaOutcome::Gap { from: 2, to: 3 });
    assert_eq!(*h.gap_requests.lock().unwrap(), vec![("items".to_string(), 2, 3)]);
    assert_eq!(h.engine.confirmed_server_seq(), 1);
    assert_eq!(h.engine.confirmed_state(), before);
    assert_eq!(h.error_kinds(), vec![ErrorKind::GapRequest]);
}

#[test]
fn gap_recovers_once_missing_deltas_arrive() {
    let mut h = Harness::new(EngineConfig::default());

    h.engine.apply_delta(server_delta(3, "three"));
    assert_eq!(
        h.engine.stream_status("items"),
        StreamStatus::GapPending { from: 1, to: 3 }
    );

    let outcomes = h.engine.apply_deltas(vec![
        server_delta(1, "one"),
        server_delta(2, "two"),
        server_delta(3, "three"),
    ]);

    assert!(outcomes.iter().all(DeltaOutcome::is_applied));
    assert_eq!(h.engine.confirmed_server_seq(), 3);
    assert_eq!(h.confirmed_value(), "three");
    assert_eq!(h.engine.stream_status("items"), StreamStatus::Synced);
}

#[test]
fn reapplying_a_delta_is_a_noop() {
    let mut h = Harness::new(EngineConfig::default().with_initial_server_seq(4));
    let delta = Delta::patch(5, "items", set_value("five")).with_prev(4);

    h.engine.apply_delta(delta.clone());
    let after_first = h.engine.confirmed_state();

    assert_eq!(h.engine.apply_delta(delta), DeltaOutcome::Stale);
    assert_eq!(h.engine.confirmed_state(), after_first);
    assert_eq!(h.engine.confirmed_server_seq(), 5);
    assert!(h.errors.lock().unwrap().is_empty());
    assert!(h.gap_requests.lock().unwrap().is_empty());
}

#[test]
fn confirmed_seq_never_moves_backwards() {
    let mut h = Harness::new(EngineConfig::default());
    let deltas = [
        Delta::patch(2, "items", set_value("two")),
        Delta::patch(1, "items", set_value("one")),
        Delta::patch(4, "items", set_value("four")).with_prev(3),
        Delta::patch(3, "items", set_value("three")).with_prev(2),
        Delta::patch(2, "items", set_value("two-again")).with_prev(1),
    ];

    let mut last = h.engine.confirmed_server_seq();
    for delta in deltas {
        h.engine.apply_delta(delta);
        assert!(h.engine.confirmed_server_seq() >= last);
        last = h.engine.confirmed_server_seq();
    }
    assert_eq!(last, 3);
    assert_eq!(h.confirmed_value(), "three");
}

#[test]
fn delta_without_prev_is_never_a_gap() {
    let mut h = Harness::new(EngineConfig::default());
    let outcome = h.engine.apply_delta(Delta::patch(10, "items", set_value("ten")));
    assert!(outcome.is_applied());
    assert_eq!(h.engine.confirmed_server_seq(), 10);
}

// ============================================================================
// Acknowledgement & Rollback
// ============================================================================

#[test]
fn rejecting_cascades_to_later_mutations() {
    let mut h = Harness::new(EngineConfig::default());
    for value in ["one", "two", "three", "four"] {
        h.predict(value);
    }

    assert!(h.engine.reject(2, "stale write"));

    assert_eq!(h.pending(), vec![1]);
    assert_eq!(h.optimistic_value(), "one");
    let errors = h.errors.lock().unwrap();
    match &errors[0] {
        SyncError::Rejection {
            client_seq,
            rolled_back,
            ..
        } => {
            assert_eq!(*client_seq, 2);
            assert_eq!(rolled_back, &vec![4, 3, 2]);
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[test]
fn echo_delta_settles_mutation() {
    let mut h = Harness::new(EngineConfig::default());
    let seq = h.predict("optimistic");

    h.engine.apply_delta(server_delta(1, "optimistic").acknowledging(seq));

    assert!(h.pending().is_empty());
    assert_eq!(h.confirmed_value(), "optimistic");
    assert_eq!(h.optimistic_value(), "optimistic");
}

#[test]
fn ack_before_delta_briefly_shows_confirmed_state() {
    let mut h = Harness::new(EngineConfig::default());
    h.predict("optimistic");

    assert!(h.engine.confirm_correlated("msg-optimistic", Some(&json!({"ok": true}))));
    assert_eq!(h.optimistic_value(), "initial");

    h.engine.apply_delta(server_delta(1, "optimistic"));
    assert_eq!(h.optimistic_value(), "optimistic");
}

#[test]
fn expired_mutations_roll_back() {
    let mut engine = Engine::builder(EngineConfig::default().with_mutation_timeout_ms(1_000))
        .state("items", json!([{"id": "1", "value": "initial"}]))
        .clock(|| 10_000)
        .build();
    engine
        .add_mutation("items", "msg-1", |items| {
            items[0]["value"] = json!("optimistic");
            Ok::<(), String>(())
        })
        .unwrap();

    assert!(engine.expire_timeouts(10_999).is_empty());
    assert_eq!(engine.expire_timeouts(11_000), vec![1]);
    assert_eq!(engine.optimistic("items").unwrap()[0]["value"], "initial");
}

// ============================================================================
// Degradation
// ============================================================================

#[test]
fn failed_prediction_leaves_no_trace() {
    let mut h = Harness::new(EngineConfig::default());
    let before = h.engine.optimistic_state();

    let result = h.engine.add_mutation("items", "msg-bad", |items| {
        items[0]["value"] = json!("partial");
        Err("title must not be empty")
    });

    assert_eq!(result, Ok(None));
    assert!(h.pending().is_empty());
    assert_eq!(h.engine.optimistic_state(), before);
    let errors = h.errors.lock().unwrap();
    match &errors[0] {
        SyncError::Produce { message, .. } => assert_eq!(message, "title must not be empty"),
        other => panic!("expected produce error, got {:?}", other),
    }
}

#[test]
fn ledger_overflow_evicts_oldest() {
    let mut h = Harness::new(EngineConfig::default().with_max_pending_mutations(3));
    for value in ["a", "b", "c", "d"] {
        h.predict(value);
    }

    assert_eq!(h.pending(), vec![2, 3, 4]);
    assert_eq!(h.error_kinds(), vec![ErrorKind::Pruning]);
    assert_eq!(h.optimistic_value(), "d");
}

#[test]
fn unreplayable_ledger_resets_to_confirmed() {
    let mut h = Harness::new(EngineConfig::default());
    h.predict("optimistic");

    h.engine.apply_delta(Delta::snapshot(1, "items", json!([])).with_prev(0));

    assert!(h.pending().is_empty());
    assert_eq!(h.engine.optimistic("items"), Some(&json!([])));
    assert_eq!(h.error_kinds(), vec![ErrorKind::Recomputation]);
}

#[test]
fn unappliable_delta_is_discarded() {
    let mut h = Harness::new(EngineConfig::default());
    let bad = Patch::from_ops(vec![PatchOp::replace(
        vec![PathSegment::index(3), PathSegment::key("value")],
        json!("x"),
    )]);

    assert_eq!(
        h.engine.apply_delta(Delta::patch(1, "items", bad).with_prev(0)),
        DeltaOutcome::ApplyFailed
    );
    assert_eq!(h.engine.confirmed_server_seq(), 0);

    // the stream is still usable
    assert!(h.engine.apply_delta(server_delta(1, "server")).is_applied());
}

// ============================================================================
// Subscriptions
// ============================================================================

#[test]
fn listeners_see_rollback_then_change() {
    let mut h = Harness::new(EngineConfig::default());
    let events: Recorded<EngineEvent> = Arc::default();
    let sink = Arc::clone(&events);
    h.engine.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    let seq = h.predict("optimistic");
    h.engine.reject(seq, "denied");

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert!(matches!(
        events[0],
        EngineEvent::Changed {
            cause: ChangeCause::MutationAdded(1),
            ..
        }
    ));
    match &events[1] {
        EngineEvent::RolledBack { reason, inverse, .. } => {
            assert_eq!(reason, &RollbackReason::Rejected("denied".into()));
            assert_eq!(inverse[0], ("items".to_string(), set_value("initial")));
        }
        other => panic!("expected rollback, got {:?}", other),
    }
    match &events[2] {
        EngineEvent::Changed { optimistic, .. } => {
            assert_eq!(optimistic["items"][0]["value"], "initial");
        }
        other => panic!("expected change, got {:?}", other),
    }
}

#[test]
fn discarded_deltas_do_not_notify() {
    let mut h = Harness::new(EngineConfig::default().with_initial_server_seq(5));
    let count = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&count);
    h.engine.subscribe(move |_| *counter.lock().unwrap() += 1);

    h.engine.apply_delta(server_delta(5, "stale"));
    h.engine.apply_delta(server_delta(9, "gapped"));

    assert_eq!(*count.lock().unwrap(), 0);
}

// ============================================================================
// Wire Format
// ============================================================================

#[test]
fn delta_from_transport_json() {
    let mut h = Harness::new(EngineConfig::default());
    let wire = json!({
        "serverSeq": 1,
        "prevServerSeq": 0,
        "targetKey": "items",
        "body": {"kind": "snapshot", "data": [{"id": "1", "value": "from-wire"}]},
    });

    let delta: Delta = serde_json::from_value(wire).unwrap();
    h.engine.apply_delta(delta);

    assert_eq!(h.confirmed_value(), "from-wire");
}

#[test]
fn rfc6902_body_from_transport() {
    let mut h = Harness::new(EngineConfig::default());
    let body = DeltaBody::from_json_patch(&json!([
        {"op": "replace", "path": "/0/value", "value": "patched"},
        {"op": "add", "path": "/-", "value": {"id": "2", "value": "appended"}},
    ]));
    let delta = Delta {
        server_seq: 1,
        prev_server_seq: Some(0),
        target_key: "items".into(),
        body,
        originating_client_seq: None,
    };

    h.engine.apply_delta(delta);

    let items = h.engine.confirmed("items").unwrap();
    assert_eq!(items[0]["value"], "patched");
    assert_eq!(items[1]["id"], "2");
}
