//! Proptest generators for property-based testing.

use proptest::prelude::*;

use tessera_core::{
    CrdtMessage, DbChange, Id, MerkleTree, NodeId, OwnerId, Timestamp, Value, MAX_MILLIS,
};

/// Generate a random NodeId.
pub fn node_id() -> impl Strategy<Value = NodeId> {
    any::<[u8; 8]>().prop_map(NodeId)
}

/// Generate a random Id (always representable in text form).
pub fn id() -> impl Strategy<Value = Id> {
    any::<[u8; 16]>().prop_map(Id::from_hash)
}

/// Generate a random OwnerId.
pub fn owner_id() -> impl Strategy<Value = OwnerId> {
    id().prop_map(OwnerId)
}

/// Generate a clock reading anywhere in the wire range.
pub fn millis() -> impl Strategy<Value = u64> {
    0..=MAX_MILLIS
}

/// Generate a timestamp.
pub fn timestamp() -> impl Strategy<Value = Timestamp> {
    (millis(), any::<u16>(), node_id()).prop_map(|(m, c, n)| Timestamp::new(m, c, n))
}

/// Generate a cell value of any kind.
pub fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Integer),
        // NaN never compares equal, keep it out of generated values.
        any::<f64>()
            .prop_filter("not NaN", |f| !f.is_nan())
            .prop_map(Value::Real),
        ".{0,64}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Blob),
    ]
}

/// Generate a table or column name.
pub fn name() -> impl Strategy<Value = String> {
    "[a-z][a-zA-Z0-9_]{0,15}".prop_map(String::from)
}

/// Generate a change over a small key space so that conflicts are common.
pub fn db_change() -> impl Strategy<Value = DbChange> {
    (
        prop::sample::select(vec!["todo", "note"]),
        0u8..4,
        prop::sample::select(vec!["title", "done", "isDeleted"]),
        value(),
    )
        .prop_map(|(table, row, column, value)| {
            DbChange::new(table, Id::from_hash([row; 16]), column, value)
        })
}

/// Generate a batch of messages with distinct timestamps.
///
/// Timestamps land within a few days so they share merkle prefixes.
pub fn messages(max_len: usize) -> impl Strategy<Value = Vec<CrdtMessage>> {
    prop::collection::vec(
        (
            1_700_000_000_000u64..1_700_300_000_000,
            0u8..3,
            db_change(),
        ),
        0..=max_len,
    )
    .prop_map(|entries| {
        entries
            .into_iter()
            .enumerate()
            .map(|(index, (millis, node, change))| CrdtMessage {
                timestamp: Timestamp::new(millis, index as u16, NodeId([node; 8])),
                change,
            })
            .collect()
    })
}

/// Fold a batch of messages into a tree.
pub fn tree_of(messages: &[CrdtMessage]) -> MerkleTree {
    messages
        .iter()
        .fold(MerkleTree::new(), |tree, m| tree.insert(&m.timestamp))
}
