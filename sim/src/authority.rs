//! In-process stand-in for the server.
//!
//! Holds the authoritative state, assigns server sequence numbers and keeps
//! every delta it ever emitted so missing ranges can be re-delivered.

use crate::error::SimError;
use foresight_engine::{patch, ClientSeq, Delta, Patch, ServerSeq, StateMap};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct Authority {
    state: StateMap,
    seq: ServerSeq,
    history: Vec<Delta>,
}

impl Authority {
    pub fn new(state: StateMap) -> Self {
        Self {
            state,
            seq: 0,
            history: Vec::new(),
        }
    }

    /// Latest assigned server sequence.
    pub fn seq(&self) -> ServerSeq {
        self.seq
    }

    pub fn state(&self) -> &StateMap {
        &self.state
    }

    /// Apply a client's patch. The emitted delta echoes `client_seq`.
    pub fn submit(
        &mut self,
        target: &str,
        patch: &Patch,
        client_seq: ClientSeq,
    ) -> Result<Delta, SimError> {
        let delta = self.commit(target, patch.clone())?;
        Ok(self.record(delta.acknowledging(client_seq)))
    }

    /// A write from another client, computed against current state.
    pub fn peer_write<F>(&mut self, target: &str, edit: F) -> Result<Delta, SimError>
    where
        F: FnOnce(&mut Value),
    {
        let current = self.state.get(target).cloned().unwrap_or(Value::Null);
        let mut next = current.clone();
        edit(&mut next);
        let delta = self.commit(target, patch::diff(&current, &next))?;
        Ok(self.record(delta))
    }

    /// Every recorded delta with `from <= server_seq <= to`.
    pub fn range(&self, from: ServerSeq, to: ServerSeq) -> Vec<Delta> {
        self.history
            .iter()
            .filter(|delta| (from..=to).contains(&delta.server_seq))
            .cloned()
            .collect()
    }

    fn commit(&mut self, target: &str, patch: Patch) -> Result<Delta, SimError> {
        let current = self.state.get(target).cloned().unwrap_or(Value::Null);
        let next =
            patch::applied(&current, &patch).map_err(|e| SimError::Rejected(e.to_string()))?;

        let prev = self.seq;
        self.seq += 1;
        self.state.insert(target.to_string(), next);
        Ok(Delta::patch(self.seq, target, patch).with_prev(prev))
    }

    fn record(&mut self, delta: Delta) -> Delta {
        self.history.push(delta.clone());
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foresight_engine::{PathSegment, PatchOp};
    use serde_json::json;

    fn authority() -> Authority {
        Authority::new([("todos".to_string(), json!([]))].into_iter().collect())
    }

    fn push(title: &str) -> Patch {
        Patch::from_ops(vec![PatchOp::add(
            vec![PathSegment::key("-")],
            json!({"title": title}),
        )])
    }

    #[test]
    fn submit_assigns_contiguous_sequences() {
        let mut authority = authority();

        let first = authority.submit("todos", &push("a"), 1).unwrap();
        let second = authority.submit("todos", &push("b"), 2).unwrap();

        assert_eq!((first.server_seq, first.prev_server_seq), (1, Some(0)));
        assert_eq!((second.server_seq, second.prev_server_seq), (2, Some(1)));
        assert_eq!(second.originating_client_seq, Some(2));
        assert_eq!(authority.state()["todos"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn invalid_patch_is_rejected_without_consuming_a_seq() {
        let mut authority = authority();
        let bad = Patch::from_ops(vec![PatchOp::remove(vec![PathSegment::index(4)])]);

        assert!(matches!(
            authority.submit("todos", &bad, 1),
            Err(SimError::Rejected(_))
        ));
        assert_eq!(authority.seq(), 0);
        assert!(authority.range(1, 10).is_empty());
    }

    #[test]
    fn peer_write_diffs_against_current_state() {
        let mut authority = authority();
        authority.submit("todos", &push("a"), 1).unwrap();

        let delta = authority
            .peer_write("todos", |todos| todos[0]["done"] = json!(true))
            .unwrap();

        assert_eq!(delta.originating_client_seq, None);
        assert_eq!(authority.state()["todos"][0]["done"], true);
    }

    #[test]
    fn range_is_inclusive() {
        let mut authority = authority();
        for i in 0..5 {
            authority.submit("todos", &push(&i.to_string()), i + 1).unwrap();
        }

        let seqs: Vec<_> = authority.range(2, 4).iter().map(|d| d.server_seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }
}
