//! Storage traits: the abstract interface for relay and replica persistence.
//!
//! Both traits are async so that SQLite (blocking, run on the blocking pool)
//! and in-memory backends can sit behind the same interface.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tessera_core::{
    CellKey, CrdtMessage, EncryptedCrdtMessage, Id, MerkleTree, NodeId, OwnerId, Timestamp, Value,
    WriteKey,
};

use crate::error::Result;

/// Result of appending a batch at the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Messages stored for the first time.
    pub inserted: usize,
    /// Messages whose timestamp was already stored.
    pub ignored: usize,
    /// The owner's tree after the batch.
    pub tree: MerkleTree,
}

/// Persisted clock of a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockState {
    pub timestamp: Timestamp,
    pub tree: MerkleTree,
}

/// Result of applying a batch at a replica.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Cells whose value changed.
    pub cells_updated: usize,
    /// Messages added to the history (and folded into the tree).
    pub newly_seen: usize,
    /// The replica tree after the batch.
    pub tree: MerkleTree,
}

/// Per-tenant storage of encrypted messages at the relay.
///
/// # Design Notes
///
/// - **First-write-wins**: the first write key presented for an unknown owner
///   is registered; later keys are compared in constant time.
/// - **All-or-nothing batches**: a quota rejection writes nothing; otherwise
///   the batch, the timestamp index and the tree snapshot commit together.
/// - **Idempotent inserts**: a timestamp already stored is ignored and not
///   folded into the tree again.
#[async_trait]
pub trait RelayStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Policy
    // ─────────────────────────────────────────────────────────────────────────

    /// External allow-list hook, consulted before any other operation.
    fn is_owner_allowed(&self, owner: &OwnerId) -> bool;

    // ─────────────────────────────────────────────────────────────────────────
    // Write Keys
    // ─────────────────────────────────────────────────────────────────────────

    /// Check `key` against the owner's registered write key, registering it
    /// if the owner has none yet.
    async fn validate_write_key(&self, owner: &OwnerId, key: &WriteKey) -> Result<bool>;

    /// Overwrite the owner's write key.
    async fn set_write_key(&self, owner: &OwnerId, key: &WriteKey) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a batch of messages.
    ///
    /// Fails with [`StoreError::QuotaExceeded`](crate::StoreError::QuotaExceeded)
    /// when the quota policy rejects `size + batch bytes`.
    async fn write_messages(
        &self,
        owner: &OwnerId,
        messages: &[EncryptedCrdtMessage],
    ) -> Result<WriteOutcome>;

    /// The owner's tree; empty for unknown owners.
    async fn merkle_tree(&self, owner: &OwnerId) -> Result<MerkleTree>;

    /// Messages with `timestamp.millis >= millis`, ascending, skipping those
    /// stamped by `exclude_node`.
    async fn messages_since(
        &self,
        owner: &OwnerId,
        millis: u64,
        exclude_node: Option<NodeId>,
    ) -> Result<Vec<EncryptedCrdtMessage>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Accounting
    // ─────────────────────────────────────────────────────────────────────────

    /// Sum of stored ciphertext sizes.
    async fn size(&self, owner: &OwnerId) -> Result<u64>;

    /// Remove every row of the owner. Returns whether anything existed.
    async fn delete_owner(&self, owner: &OwnerId) -> Result<bool>;
}

/// Local replica storage: clock, history, resolved cells.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Clock
    // ─────────────────────────────────────────────────────────────────────────

    /// The persisted clock, or `None` for a fresh store.
    async fn load_clock(&self) -> Result<Option<ClockState>>;

    /// Persist the clock timestamp alone.
    async fn save_clock(&self, clock: &Timestamp) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Merge a batch and persist `clock`, all in one transaction.
    async fn apply_messages(&self, messages: &[CrdtMessage], clock: &Timestamp)
        -> Result<ApplySummary>;

    /// History messages with `timestamp.millis >= millis`, ascending.
    async fn messages_since(&self, millis: u64) -> Result<Vec<CrdtMessage>>;

    async fn merkle_tree(&self) -> Result<MerkleTree>;

    // ─────────────────────────────────────────────────────────────────────────
    // Cells
    // ─────────────────────────────────────────────────────────────────────────

    async fn cell(&self, key: &CellKey) -> Result<Option<(Timestamp, Value)>>;

    /// All resolved columns of a row.
    async fn row(&self, table: &str, id: &Id) -> Result<BTreeMap<String, Value>>;

    /// Every resolved cell in key order.
    async fn cells(&self) -> Result<Vec<(CellKey, Timestamp, Value)>>;
}

/// Total ciphertext bytes of a batch.
pub fn batch_bytes(messages: &[EncryptedCrdtMessage]) -> u64 {
    messages.iter().map(|m| m.change.len() as u64).sum()
}
