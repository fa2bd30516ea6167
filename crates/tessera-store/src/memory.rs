//! In-memory implementations of the storage traits.
//!
//! Primarily for testing. Same semantics as SQLite, nothing persisted.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use tessera_core::{
    CellKey, CrdtMessage, EncryptedCrdtMessage, Id, MerkleTree, NodeId, OwnerId, ReplicaState,
    Timestamp, Value, WriteKey,
};

use crate::error::{Result, StoreError};
use crate::policy::{AllowAll, OwnerPolicy};
use crate::traits::{batch_bytes, ApplySummary, ClockState, RelayStore, ReplicaStore, WriteOutcome};

// ─────────────────────────────────────────────────────────────────────────────
// Relay
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory relay storage. Thread-safe via RwLock.
pub struct MemoryRelayStore {
    owners: RwLock<HashMap<OwnerId, OwnerEntry>>,
    policy: Arc<dyn OwnerPolicy>,
}

#[derive(Default)]
struct OwnerEntry {
    write_key: Option<WriteKey>,
    tree: MerkleTree,
    messages: BTreeMap<Timestamp, Bytes>,
}

impl OwnerEntry {
    fn size(&self) -> u64 {
        self.messages.values().map(|c| c.len() as u64).sum()
    }
}

impl MemoryRelayStore {
    pub fn new() -> Self {
        Self {
            owners: RwLock::new(HashMap::new()),
            policy: Arc::new(AllowAll),
        }
    }

    /// Replace the owner policy.
    pub fn with_policy(mut self, policy: impl OwnerPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }
}

impl Default for MemoryRelayStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayStore for MemoryRelayStore {
    fn is_owner_allowed(&self, owner: &OwnerId) -> bool {
        self.policy.is_owner_allowed(owner)
    }

    async fn validate_write_key(&self, owner: &OwnerId, key: &WriteKey) -> Result<bool> {
        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);
        let entry = owners.entry(*owner).or_default();
        match &entry.write_key {
            Some(stored) => Ok(stored.ct_eq(key)),
            None => {
                entry.write_key = Some(*key);
                Ok(true)
            }
        }
    }

    async fn set_write_key(&self, owner: &OwnerId, key: &WriteKey) -> Result<()> {
        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);
        owners.entry(*owner).or_default().write_key = Some(*key);
        Ok(())
    }

    async fn write_messages(
        &self,
        owner: &OwnerId,
        messages: &[EncryptedCrdtMessage],
    ) -> Result<WriteOutcome> {
        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);

        if messages.is_empty() {
            let tree = owners.get(owner).map(|e| e.tree.clone()).unwrap_or_default();
            return Ok(WriteOutcome {
                inserted: 0,
                ignored: 0,
                tree,
            });
        }

        let current = owners.get(owner).map(OwnerEntry::size).unwrap_or(0);
        let required_bytes = current + batch_bytes(messages);
        if !self.policy.is_owner_within_quota(owner, required_bytes) {
            return Err(StoreError::QuotaExceeded {
                owner: *owner,
                required_bytes,
            });
        }

        let entry = owners.entry(*owner).or_default();
        let mut inserted = 0;
        for message in messages {
            if entry.messages.contains_key(&message.timestamp) {
                continue;
            }
            entry
                .messages
                .insert(message.timestamp, message.change.clone());
            entry.tree = entry.tree.insert(&message.timestamp);
            inserted += 1;
        }

        Ok(WriteOutcome {
            inserted,
            ignored: messages.len() - inserted,
            tree: entry.tree.clone(),
        })
    }

    async fn merkle_tree(&self, owner: &OwnerId) -> Result<MerkleTree> {
        let owners = self.owners.read().unwrap_or_else(PoisonError::into_inner);
        Ok(owners.get(owner).map(|e| e.tree.clone()).unwrap_or_default())
    }

    async fn messages_since(
        &self,
        owner: &OwnerId,
        millis: u64,
        exclude_node: Option<NodeId>,
    ) -> Result<Vec<EncryptedCrdtMessage>> {
        let owners = self.owners.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = owners.get(owner) else {
            return Ok(Vec::new());
        };

        Ok(entry
            .messages
            .range(Timestamp::watermark(millis)..)
            .filter(|(ts, _)| Some(ts.node) != exclude_node)
            .map(|(ts, change)| EncryptedCrdtMessage::new(*ts, change.clone()))
            .collect())
    }

    async fn size(&self, owner: &OwnerId) -> Result<u64> {
        let owners = self.owners.read().unwrap_or_else(PoisonError::into_inner);
        Ok(owners.get(owner).map(OwnerEntry::size).unwrap_or(0))
    }

    async fn delete_owner(&self, owner: &OwnerId) -> Result<bool> {
        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);
        Ok(owners.remove(owner).is_some())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replica
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory replica over [`ReplicaState`].
#[derive(Default)]
pub struct MemoryReplicaStore {
    inner: RwLock<MemoryReplicaInner>,
}

#[derive(Default)]
struct MemoryReplicaInner {
    clock: Option<Timestamp>,
    state: ReplicaState,
}

impl MemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplicaStore for MemoryReplicaStore {
    async fn load_clock(&self) -> Result<Option<ClockState>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.clock.map(|timestamp| ClockState {
            timestamp,
            tree: inner.state.tree().clone(),
        }))
    }

    async fn save_clock(&self, clock: &Timestamp) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.clock = Some(*clock);
        Ok(())
    }

    async fn apply_messages(
        &self,
        messages: &[CrdtMessage],
        clock: &Timestamp,
    ) -> Result<ApplySummary> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut summary = ApplySummary::default();

        for message in messages {
            let outcome = inner.state.apply(message);
            summary.cells_updated += usize::from(outcome.cell_updated);
            summary.newly_seen += usize::from(outcome.newly_seen);
        }

        inner.clock = Some(*clock);
        summary.tree = inner.state.tree().clone();
        Ok(summary)
    }

    async fn messages_since(&self, millis: u64) -> Result<Vec<CrdtMessage>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.state.messages_since(millis))
    }

    async fn merkle_tree(&self) -> Result<MerkleTree> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.state.tree().clone())
    }

    async fn cell(&self, key: &CellKey) -> Result<Option<(Timestamp, Value)>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.state.cell(key).cloned())
    }

    async fn row(&self, table: &str, id: &Id) -> Result<BTreeMap<String, Value>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.state.row(table, id))
    }

    async fn cells(&self) -> Result<Vec<(CellKey, Timestamp, Value)>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .state
            .cells()
            .map(|(key, (ts, value))| (key.clone(), *ts, value.clone()))
            .collect())
    }
}
