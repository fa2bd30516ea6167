//! Last-write-wins merge of column-level mutations.
//!
//! A cell takes the value of the message with the greatest timestamp. Every
//! message, winning or not, is kept in the history exactly once and folded
//! into the merkle tree the first time it is seen, so two replicas that have
//! seen the same messages hold the same tree.

use std::collections::BTreeMap;

use crate::merkle::MerkleTree;
use crate::message::{CellKey, CrdtMessage, DbChange, Value};
use crate::timestamp::Timestamp;
use crate::types::Id;

/// What to do with an incoming message for a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// The message is newer than the stored value (or the cell is empty).
    Apply,
    /// The message carries exactly the stored timestamp.
    Duplicate,
    /// The stored value is newer.
    Stale,
}

/// Decide a cell update given the stored cell timestamp.
pub fn decide(existing: Option<&Timestamp>, incoming: &Timestamp) -> MergeDecision {
    match existing {
        None => MergeDecision::Apply,
        Some(current) if incoming > current => MergeDecision::Apply,
        Some(current) if incoming == current => MergeDecision::Duplicate,
        Some(_) => MergeDecision::Stale,
    }
}

/// Effect of applying one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// The cell now holds the message value.
    pub cell_updated: bool,
    /// The timestamp was new to the history (and the tree).
    pub newly_seen: bool,
}

/// In-memory resolved state of a replica.
#[derive(Debug, Clone, Default)]
pub struct ReplicaState {
    cells: BTreeMap<CellKey, (Timestamp, Value)>,
    history: BTreeMap<Timestamp, DbChange>,
    tree: MerkleTree,
}

impl ReplicaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one message. Re-applying a message is a no-op.
    pub fn apply(&mut self, message: &CrdtMessage) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let key = message.change.cell_key();

        let existing = self.cells.get(&key).map(|(ts, _)| ts);
        if decide(existing, &message.timestamp) == MergeDecision::Apply {
            self.cells
                .insert(key, (message.timestamp, message.change.value.clone()));
            outcome.cell_updated = true;
        }

        if !self.history.contains_key(&message.timestamp) {
            self.history
                .insert(message.timestamp, message.change.clone());
            self.tree = self.tree.insert(&message.timestamp);
            outcome.newly_seen = true;
        }

        outcome
    }

    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    /// Current value and timestamp of a cell.
    pub fn cell(&self, key: &CellKey) -> Option<&(Timestamp, Value)> {
        self.cells.get(key)
    }

    /// All resolved columns of a row.
    pub fn row(&self, table: &str, id: &Id) -> BTreeMap<String, Value> {
        self.cells
            .iter()
            .filter(|(k, _)| k.table == table && &k.id == id)
            .map(|(k, (_, v))| (k.column.clone(), v.clone()))
            .collect()
    }

    /// Resolved cells in key order.
    pub fn cells(&self) -> impl Iterator<Item = (&CellKey, &(Timestamp, Value))> {
        self.cells.iter()
    }

    /// History messages with `timestamp.millis >= millis`, ascending.
    pub fn messages_since(&self, millis: u64) -> Vec<CrdtMessage> {
        self.history
            .range(Timestamp::watermark(millis)..)
            .map(|(ts, change)| CrdtMessage {
                timestamp: *ts,
                change: change.clone(),
            })
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;
    use proptest::prelude::*;

    fn message(millis: u64, node: u8, column: &str, value: i64) -> CrdtMessage {
        CrdtMessage {
            timestamp: Timestamp::new(millis, 0, NodeId([node; 8])),
            change: DbChange::new("todo", Id::from_hash([7; 16]), column, value),
        }
    }

    fn resolved(state: &ReplicaState) -> Vec<(CellKey, Timestamp, Value)> {
        state
            .cells()
            .map(|(k, (t, v))| (k.clone(), *t, v.clone()))
            .collect()
    }

    #[test]
    fn test_decide() {
        let older = Timestamp::new(1, 0, NodeId([1; 8]));
        let newer = Timestamp::new(2, 0, NodeId([1; 8]));
        assert_eq!(decide(None, &older), MergeDecision::Apply);
        assert_eq!(decide(Some(&older), &newer), MergeDecision::Apply);
        assert_eq!(decide(Some(&newer), &newer), MergeDecision::Duplicate);
        assert_eq!(decide(Some(&newer), &older), MergeDecision::Stale);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut state = ReplicaState::new();
        let m = message(1_000, 1, "title", 1);
        let first = state.apply(&m);
        let tree = state.tree().clone();
        let second = state.apply(&m);

        assert!(first.cell_updated && first.newly_seen);
        assert_eq!(second, ApplyOutcome::default());
        assert_eq!(state.tree(), &tree);
        assert_eq!(state.history_len(), 1);
    }

    #[test]
    fn test_stale_message_keeps_value_but_enters_history() {
        let mut state = ReplicaState::new();
        let newer = message(2_000, 1, "title", 2);
        let older = message(1_000, 2, "title", 1);
        state.apply(&newer);
        let outcome = state.apply(&older);

        assert!(!outcome.cell_updated);
        assert!(outcome.newly_seen);
        let key = newer.change.cell_key();
        assert_eq!(state.cell(&key).unwrap().1, Value::Integer(2));
        assert_eq!(state.messages_since(0).len(), 2);
    }

    #[test]
    fn test_node_breaks_ties() {
        let mut state = ReplicaState::new();
        state.apply(&message(1_000, 9, "title", 9));
        state.apply(&message(1_000, 1, "title", 1));
        let key = message(0, 0, "title", 0).change.cell_key();
        assert_eq!(state.cell(&key).unwrap().1, Value::Integer(9));
    }

    #[test]
    fn test_row_and_soft_delete() {
        let mut state = ReplicaState::new();
        let id = Id::from_hash([7; 16]);
        state.apply(&message(1_000, 1, "title", 5));
        state.apply(&CrdtMessage {
            timestamp: Timestamp::new(2_000, 0, NodeId([1; 8])),
            change: DbChange::delete("todo", id),
        });
        let row = state.row("todo", &id);
        assert_eq!(row.get("title"), Some(&Value::Integer(5)));
        assert_eq!(row.get(crate::message::IS_DELETED_COLUMN), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_messages_since() {
        let mut state = ReplicaState::new();
        for millis in [1_000, 61_000, 121_000] {
            state.apply(&message(millis, 1, &format!("c{millis}"), 0));
        }
        let since = state.messages_since(61_000);
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].timestamp.millis, 61_000);
    }

    fn messages() -> impl Strategy<Value = Vec<CrdtMessage>> {
        prop::collection::vec(
            (0u64..10, 1u8..4, prop::sample::select(vec!["a", "b"]), any::<i64>()),
            0..20,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, (m, n, c, v))| {
                    // the counter keeps every timestamp unique
                    let mut msg = message(m, n, c, v);
                    msg.timestamp.counter = i as u16;
                    msg
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn test_apply_order_independent(msgs in messages(), seed in any::<u64>()) {
            let mut shuffled = msgs.clone();
            // deterministic rotation stands in for a shuffle
            if !shuffled.is_empty() {
                let k = (seed as usize) % shuffled.len();
                shuffled.rotate_left(k);
                shuffled.reverse();
            }

            let mut a = ReplicaState::new();
            msgs.iter().for_each(|m| { a.apply(m); });
            let mut b = ReplicaState::new();
            shuffled.iter().for_each(|m| { b.apply(m); });
            // replaying everything is a no-op
            msgs.iter().for_each(|m| { b.apply(m); });

            prop_assert_eq!(a.tree(), b.tree());
            prop_assert_eq!(resolved(&a), resolved(&b));
        }
    }
}
