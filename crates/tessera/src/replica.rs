//! The Replica: a client's full copy of an owner's data.
//!
//! A replica stamps local changes, applies them immediately, queues them for
//! the relay and syncs on demand. Reads always come from the local store.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tessera_core::{
    CellKey, CrdtMessage, DbChange, Id, NodeId, TimeSource, Timestamp, Value, IS_DELETED_COLUMN,
};
use tessera_keys::Owner;
use tessera_store::ReplicaStore;
use tessera_sync::{SyncConfig, SyncOutcome, SyncSession, SyncState, Transport};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::error::Result;

/// Configuration for a replica.
#[derive(Debug, Clone, Default)]
pub struct ReplicaConfig {
    pub sync: SyncConfig,
}

/// The main Replica struct.
///
/// Provides a unified API for:
/// - Writing column-level changes
/// - Querying resolved rows and cells
/// - Syncing with the relay
pub struct Replica<S: ReplicaStore> {
    session: SyncSession<S>,
    /// Local messages not yet confirmed by a completed sync.
    pending: Mutex<Vec<CrdtMessage>>,
}

impl<S: ReplicaStore> Replica<S> {
    /// Open a replica over `store`.
    ///
    /// A fresh store gets a random node id and a zero clock; an existing one
    /// keeps the node id of its persisted clock.
    pub async fn open(
        owner: Owner,
        store: S,
        time: Arc<dyn TimeSource>,
        config: ReplicaConfig,
    ) -> Result<Self> {
        let store = Arc::new(store);
        let node = match store.load_clock().await? {
            Some(clock) => clock.timestamp.node,
            None => {
                let node = NodeId::random();
                store.save_clock(&Timestamp::zero(node)).await?;
                debug!(%node, "initialized replica clock");
                node
            }
        };

        Ok(Self {
            session: SyncSession::new(owner, node, store, time, config.sync),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn owner(&self) -> &Owner {
        self.session.owner()
    }

    pub fn node(&self) -> NodeId {
        self.session.node()
    }

    pub fn store(&self) -> &S {
        self.session.store()
    }

    pub fn session(&self) -> &SyncSession<S> {
        &self.session
    }

    pub fn sync_state(&self) -> SyncState {
        self.session.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.session.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Stamp and apply changes, then queue them for the relay.
    ///
    /// All or nothing: a clock error leaves the replica untouched.
    pub async fn mutate(&self, changes: Vec<DbChange>) -> Result<Vec<CrdtMessage>> {
        let messages = self.session.mutate(changes).await?;
        self.pending.lock().await.extend(messages.iter().cloned());
        Ok(messages)
    }

    /// Set one column.
    pub async fn set(
        &self,
        table: &str,
        id: Id,
        column: &str,
        value: impl Into<Value>,
    ) -> Result<CrdtMessage> {
        let mut messages = self
            .mutate(vec![DbChange::new(table, id, column, value)])
            .await?;
        Ok(messages.remove(0))
    }

    /// Insert a row with a fresh id.
    pub async fn insert<C, V>(&self, table: &str, columns: C) -> Result<Id>
    where
        C: IntoIterator<Item = (&'static str, V)>,
        V: Into<Value>,
    {
        let id = Id::random();
        let changes = columns
            .into_iter()
            .map(|(column, value)| DbChange::new(table, id, column, value))
            .collect();
        self.mutate(changes).await?;
        Ok(id)
    }

    /// Soft-delete a row.
    pub async fn delete(&self, table: &str, id: Id) -> Result<()> {
        self.mutate(vec![DbChange::delete(table, id)]).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a sync round with the pending messages.
    ///
    /// Pending messages are dropped from the queue only once the round
    /// completes; on failure they are retried next time.
    pub async fn sync(&self, transport: &dyn Transport) -> Result<SyncOutcome> {
        let outgoing = self.pending.lock().await.clone();
        let outcome = self.session.sync(transport, outgoing.clone()).await?;

        if matches!(outcome, SyncOutcome::Completed(_)) && !outgoing.is_empty() {
            let sent: HashSet<Timestamp> = outgoing.iter().map(|m| m.timestamp).collect();
            self.pending
                .lock()
                .await
                .retain(|m| !sent.contains(&m.timestamp));
        }
        Ok(outcome)
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Resolved value of one cell.
    pub async fn get(&self, table: &str, id: Id, column: &str) -> Result<Option<Value>> {
        let key = CellKey {
            table: table.to_string(),
            id,
            column: column.to_string(),
        };
        Ok(self.store().cell(&key).await?.map(|(_, value)| value))
    }

    /// All resolved columns of a row, or `None` if it was never written or
    /// has been deleted.
    pub async fn row(&self, table: &str, id: Id) -> Result<Option<BTreeMap<String, Value>>> {
        let row = self.store().row(table, &id).await?;
        if row.is_empty() || is_deleted(&row) {
            return Ok(None);
        }
        Ok(Some(row))
    }

    /// Ids of the live rows of a table, in id order.
    pub async fn row_ids(&self, table: &str) -> Result<Vec<Id>> {
        let mut rows: BTreeMap<Id, bool> = BTreeMap::new();
        for (key, _, value) in self.store().cells().await? {
            if key.table != table {
                continue;
            }
            let deleted = rows.entry(key.id).or_insert(false);
            if key.column == IS_DELETED_COLUMN && value == Value::from(true) {
                *deleted = true;
            }
        }
        Ok(rows
            .into_iter()
            .filter_map(|(id, deleted)| (!deleted).then_some(id))
            .collect())
    }
}

fn is_deleted(row: &BTreeMap<String, Value>) -> bool {
    row.get(IS_DELETED_COLUMN) == Some(&Value::from(true))
}
