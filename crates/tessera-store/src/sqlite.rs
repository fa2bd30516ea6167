//! SQLite implementations of the storage traits.
//!
//! rusqlite with bundled SQLite, wrapped in async via `spawn_blocking`. Every
//! multi-step write runs inside one transaction, so a failed or rejected
//! batch leaves the database exactly as it was.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use tessera_core::{
    decide, CellKey, CrdtMessage, DbChange, EncryptedCrdtMessage, Id, MergeDecision, MerkleTree,
    NodeId, OwnerId, Timestamp, Value, WriteKey,
};

use crate::error::{Result, StoreError};
use crate::migration::{self, Schema};
use crate::policy::{AllowAll, OwnerPolicy};
use crate::traits::{batch_bytes, ApplySummary, ClockState, RelayStore, ReplicaStore, WriteOutcome};

// ─────────────────────────────────────────────────────────────────────────────
// Shared helpers
// ─────────────────────────────────────────────────────────────────────────────

fn open_connection(path: Option<&Path>, schema: Schema) -> Result<Arc<Mutex<Connection>>> {
    let mut conn = match path {
        Some(path) => Connection::open(path)?,
        None => Connection::open_in_memory()?,
    };
    migration::migrate(&mut conn, schema)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| {
        StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            Some(format!("mutex poisoned: {}", e)),
        ))
    })
}

/// Run `f` against the connection on the blocking pool.
async fn blocking<F, T>(conn: &Arc<Mutex<Connection>>, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = lock(&conn)?;
        f(&mut guard)
    })
    .await
    .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {}", e)))?
}

fn encode_tree(tree: &MerkleTree) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(tree, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode_tree(bytes: &[u8]) -> Result<MerkleTree> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(err))
}

fn blob_array<const N: usize>(row: &Row<'_>, idx: usize) -> rusqlite::Result<[u8; N]> {
    let bytes: Vec<u8> = row.get(idx)?;
    bytes
        .try_into()
        .map_err(|_| rusqlite::Error::InvalidColumnType(idx, format!("blob[{}]", N), Type::Blob))
}

fn row_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let bytes: Vec<u8> = row.get(idx)?;
    Timestamp::from_bytes(&bytes).map_err(|e| conversion_error(idx, e))
}

fn row_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<Id> {
    Id::from_bytes(blob_array(row, idx)?).map_err(|e| conversion_error(idx, e))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(i),
        SqlValue::Real(f) => Value::Real(f),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Blob(b),
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// Relay
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed relay storage.
///
/// Thread-safe via internal Mutex. Tenants share one database file; every
/// row is keyed by owner id.
pub struct SqliteRelayStore {
    conn: Arc<Mutex<Connection>>,
    policy: Arc<dyn OwnerPolicy>,
}

impl SqliteRelayStore {
    /// Open a relay database at the given path, running migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            conn: open_connection(Some(path.as_ref()), Schema::Relay)?,
            policy: Arc::new(AllowAll),
        })
    }

    /// Open an in-memory relay database.
    pub fn open_memory() -> Result<Self> {
        Ok(Self {
            conn: open_connection(None, Schema::Relay)?,
            policy: Arc::new(AllowAll),
        })
    }

    /// Replace the owner policy.
    pub fn with_policy(mut self, policy: impl OwnerPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }
}

fn relay_owner_size(conn: &Connection, owner: &OwnerId) -> Result<u64> {
    let size: i64 = conn.query_row(
        "SELECT COALESCE(SUM(length(change)), 0) FROM messages WHERE owner_id = ?1",
        params![owner.as_bytes().as_slice()],
        |row| row.get(0),
    )?;
    Ok(size as u64)
}

fn relay_owner_tree(conn: &Connection, owner: &OwnerId) -> Result<MerkleTree> {
    let snapshot: Option<Vec<u8>> = conn
        .query_row(
            "SELECT merkle_tree FROM owners WHERE owner_id = ?1",
            params![owner.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    match snapshot {
        Some(bytes) => decode_tree(&bytes),
        None => Ok(MerkleTree::new()),
    }
}

fn relay_upsert_write_key(tx: &Transaction<'_>, owner: &OwnerId, key: &WriteKey) -> Result<()> {
    tx.execute(
        "INSERT INTO owners (owner_id, write_key, merkle_tree, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(owner_id) DO UPDATE SET write_key = excluded.write_key",
        params![
            owner.as_bytes().as_slice(),
            key.as_bytes().as_slice(),
            encode_tree(&MerkleTree::new())?,
            now_millis(),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl RelayStore for SqliteRelayStore {
    fn is_owner_allowed(&self, owner: &OwnerId) -> bool {
        self.policy.is_owner_allowed(owner)
    }

    async fn validate_write_key(&self, owner: &OwnerId, key: &WriteKey) -> Result<bool> {
        let owner = *owner;
        let key = *key;

        blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;

            let stored: Option<Option<Vec<u8>>> = tx
                .query_row(
                    "SELECT write_key FROM owners WHERE owner_id = ?1",
                    params![owner.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;

            match stored.flatten() {
                Some(bytes) => {
                    let stored: [u8; 16] = bytes.try_into().map_err(|_| {
                        StoreError::InvalidData(format!("write key of {} is not 16 bytes", owner))
                    })?;
                    Ok(WriteKey::from_bytes(stored).ct_eq(&key))
                }
                None => {
                    relay_upsert_write_key(&tx, &owner, &key)?;
                    tx.commit()?;
                    tracing::info!(%owner, "registered write key");
                    Ok(true)
                }
            }
        })
        .await
    }

    async fn set_write_key(&self, owner: &OwnerId, key: &WriteKey) -> Result<()> {
        let owner = *owner;
        let key = *key;

        blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            relay_upsert_write_key(&tx, &owner, &key)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn write_messages(
        &self,
        owner: &OwnerId,
        messages: &[EncryptedCrdtMessage],
    ) -> Result<WriteOutcome> {
        let owner = *owner;
        let messages = messages.to_vec();
        let policy = self.policy.clone();

        blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let mut tree = relay_owner_tree(&tx, &owner)?;

            if messages.is_empty() {
                return Ok(WriteOutcome {
                    inserted: 0,
                    ignored: 0,
                    tree,
                });
            }

            let required_bytes = relay_owner_size(&tx, &owner)? + batch_bytes(&messages);
            if !policy.is_owner_within_quota(&owner, required_bytes) {
                // Dropping the transaction rolls back; nothing was written yet.
                return Err(StoreError::QuotaExceeded {
                    owner,
                    required_bytes,
                });
            }

            tx.execute(
                "INSERT OR IGNORE INTO owners (owner_id, write_key, merkle_tree, created_at)
                 VALUES (?1, NULL, ?2, ?3)",
                params![
                    owner.as_bytes().as_slice(),
                    encode_tree(&tree)?,
                    now_millis()
                ],
            )?;

            let mut inserted = 0;
            {
                let mut index = tx.prepare_cached(
                    "INSERT OR IGNORE INTO timestamps (owner_id, timestamp) VALUES (?1, ?2)",
                )?;
                let mut blobs = tx.prepare_cached(
                    "INSERT INTO messages (owner_id, timestamp, change) VALUES (?1, ?2, ?3)",
                )?;

                for message in &messages {
                    let ts = message.timestamp.to_bytes();
                    if index.execute(params![owner.as_bytes().as_slice(), ts.as_slice()])? == 0 {
                        continue;
                    }
                    blobs.execute(params![
                        owner.as_bytes().as_slice(),
                        ts.as_slice(),
                        message.change.as_ref()
                    ])?;
                    tree = tree.insert(&message.timestamp);
                    inserted += 1;
                }
            }

            tx.execute(
                "UPDATE owners SET merkle_tree = ?2 WHERE owner_id = ?1",
                params![owner.as_bytes().as_slice(), encode_tree(&tree)?],
            )?;
            tx.commit()?;

            tracing::debug!(%owner, inserted, total = messages.len(), "stored messages");
            Ok(WriteOutcome {
                inserted,
                ignored: messages.len() - inserted,
                tree,
            })
        })
        .await
    }

    async fn merkle_tree(&self, owner: &OwnerId) -> Result<MerkleTree> {
        let owner = *owner;
        blocking(&self.conn, move |conn| relay_owner_tree(conn, &owner)).await
    }

    async fn messages_since(
        &self,
        owner: &OwnerId,
        millis: u64,
        exclude_node: Option<NodeId>,
    ) -> Result<Vec<EncryptedCrdtMessage>> {
        let owner = *owner;

        blocking(&self.conn, move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp, change FROM messages
                 WHERE owner_id = ?1 AND timestamp >= ?2
                 ORDER BY timestamp",
            )?;
            let rows = stmt.query_map(
                params![
                    owner.as_bytes().as_slice(),
                    Timestamp::watermark(millis).to_bytes().as_slice()
                ],
                |row| {
                    let change: Vec<u8> = row.get(1)?;
                    Ok(EncryptedCrdtMessage::new(
                        row_timestamp(row, 0)?,
                        Bytes::from(change),
                    ))
                },
            )?;

            let mut messages = Vec::new();
            for message in rows {
                let message = message?;
                if Some(message.timestamp.node) != exclude_node {
                    messages.push(message);
                }
            }
            Ok(messages)
        })
        .await
    }

    async fn size(&self, owner: &OwnerId) -> Result<u64> {
        let owner = *owner;
        blocking(&self.conn, move |conn| relay_owner_size(conn, &owner)).await
    }

    async fn delete_owner(&self, owner: &OwnerId) -> Result<bool> {
        let owner = *owner;

        blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let key = owner.as_bytes().as_slice();
            let mut removed = 0;
            removed += tx.execute("DELETE FROM messages WHERE owner_id = ?1", params![key])?;
            removed += tx.execute("DELETE FROM timestamps WHERE owner_id = ?1", params![key])?;
            removed += tx.execute("DELETE FROM owners WHERE owner_id = ?1", params![key])?;
            tx.commit()?;

            tracing::info!(%owner, rows = removed, "deleted owner");
            Ok(removed > 0)
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replica
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed local replica.
pub struct SqliteReplicaStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteReplicaStore {
    /// Open a replica database at the given path, running migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            conn: open_connection(Some(path.as_ref()), Schema::Replica)?,
        })
    }

    /// Open an in-memory replica database.
    pub fn open_memory() -> Result<Self> {
        Ok(Self {
            conn: open_connection(None, Schema::Replica)?,
        })
    }
}

fn replica_tree(conn: &Connection) -> Result<MerkleTree> {
    let snapshot: Option<Vec<u8>> = conn
        .query_row("SELECT merkle_tree FROM crdt_clock WHERE id = 0", [], |row| {
            row.get(0)
        })
        .optional()?;
    match snapshot {
        Some(bytes) => decode_tree(&bytes),
        None => Ok(MerkleTree::new()),
    }
}

fn replica_write_clock(conn: &Connection, clock: &Timestamp, tree: &MerkleTree) -> Result<()> {
    conn.execute(
        "INSERT INTO crdt_clock (id, timestamp, merkle_tree) VALUES (0, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET timestamp = excluded.timestamp,
                                       merkle_tree = excluded.merkle_tree",
        params![clock.to_bytes().as_slice(), encode_tree(tree)?],
    )?;
    Ok(())
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<CrdtMessage> {
    Ok(CrdtMessage {
        timestamp: row_timestamp(row, 0)?,
        change: DbChange {
            table: row.get(1)?,
            id: row_id(row, 2)?,
            column: row.get(3)?,
            value: from_sql(row.get(4)?),
        },
    })
}

#[async_trait]
impl ReplicaStore for SqliteReplicaStore {
    async fn load_clock(&self) -> Result<Option<ClockState>> {
        blocking(&self.conn, |conn| {
            let row: Option<(Timestamp, Vec<u8>)> = conn
                .query_row(
                    "SELECT timestamp, merkle_tree FROM crdt_clock WHERE id = 0",
                    [],
                    |row| Ok((row_timestamp(row, 0)?, row.get(1)?)),
                )
                .optional()?;

            row.map(|(timestamp, tree)| {
                Ok(ClockState {
                    timestamp,
                    tree: decode_tree(&tree)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn save_clock(&self, clock: &Timestamp) -> Result<()> {
        let clock = *clock;
        blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let tree = replica_tree(&tx)?;
            replica_write_clock(&tx, &clock, &tree)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn apply_messages(
        &self,
        messages: &[CrdtMessage],
        clock: &Timestamp,
    ) -> Result<ApplySummary> {
        let messages = messages.to_vec();
        let clock = *clock;

        blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let mut summary = ApplySummary {
                tree: replica_tree(&tx)?,
                ..Default::default()
            };

            {
                let mut history = tx.prepare_cached(
                    "INSERT OR IGNORE INTO crdt_messages
                        (timestamp, table_name, row_id, column_name, value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                let mut current = tx.prepare_cached(
                    "SELECT timestamp FROM crdt_cells
                     WHERE table_name = ?1 AND row_id = ?2 AND column_name = ?3",
                )?;
                let mut upsert = tx.prepare_cached(
                    "INSERT INTO crdt_cells (table_name, row_id, column_name, timestamp, value)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(table_name, row_id, column_name)
                     DO UPDATE SET timestamp = excluded.timestamp, value = excluded.value",
                )?;

                for message in &messages {
                    let ts = message.timestamp.to_bytes();
                    let change = &message.change;
                    let row_key = change.id.as_bytes().as_slice();
                    let value = to_sql(&change.value);

                    let new = history.execute(params![
                        ts.as_slice(),
                        change.table,
                        row_key,
                        change.column,
                        value
                    ])? == 1;
                    if new {
                        summary.tree = summary.tree.insert(&message.timestamp);
                        summary.newly_seen += 1;
                    }

                    let existing = current
                        .query_row(params![change.table, row_key, change.column], |row| {
                            row_timestamp(row, 0)
                        })
                        .optional()?;
                    if decide(existing.as_ref(), &message.timestamp) == MergeDecision::Apply {
                        upsert.execute(params![
                            change.table,
                            row_key,
                            change.column,
                            ts.as_slice(),
                            value
                        ])?;
                        summary.cells_updated += 1;
                    }
                }
            }

            replica_write_clock(&tx, &clock, &summary.tree)?;
            tx.commit()?;
            Ok(summary)
        })
        .await
    }

    async fn messages_since(&self, millis: u64) -> Result<Vec<CrdtMessage>> {
        blocking(&self.conn, move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp, table_name, row_id, column_name, value FROM crdt_messages
                 WHERE timestamp >= ?1 ORDER BY timestamp",
            )?;
            let rows = stmt.query_map(
                params![Timestamp::watermark(millis).to_bytes().as_slice()],
                row_to_message,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn merkle_tree(&self) -> Result<MerkleTree> {
        blocking(&self.conn, |conn| replica_tree(conn)).await
    }

    async fn cell(&self, key: &CellKey) -> Result<Option<(Timestamp, Value)>> {
        let key = key.clone();
        blocking(&self.conn, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT timestamp, value FROM crdt_cells
                     WHERE table_name = ?1 AND row_id = ?2 AND column_name = ?3",
                    params![key.table, key.id.as_bytes().as_slice(), key.column],
                    |row| Ok((row_timestamp(row, 0)?, from_sql(row.get(1)?))),
                )
                .optional()?)
        })
        .await
    }

    async fn row(&self, table: &str, id: &Id) -> Result<BTreeMap<String, Value>> {
        let table = table.to_string();
        let id = *id;
        blocking(&self.conn, move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT column_name, value FROM crdt_cells WHERE table_name = ?1 AND row_id = ?2",
            )?;
            let rows = stmt.query_map(params![table, id.as_bytes().as_slice()], |row| {
                Ok((row.get::<_, String>(0)?, from_sql(row.get(1)?)))
            })?;
            Ok(rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?)
        })
        .await
    }

    async fn cells(&self) -> Result<Vec<(CellKey, Timestamp, Value)>> {
        blocking(&self.conn, |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT table_name, row_id, column_name, timestamp, value FROM crdt_cells",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    CellKey {
                        table: row.get(0)?,
                        id: row_id(row, 1)?,
                        column: row.get(2)?,
                    },
                    row_timestamp(row, 3)?,
                    from_sql(row.get(4)?),
                ))
            })?;
            let mut cells = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            // Key order, same as the memory backend.
            cells.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(cells)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AllowList, QuotaLimit};

    fn owner(byte: u8) -> OwnerId {
        OwnerId(Id::from_hash([byte; 16]))
    }

    fn ts(millis: u64, counter: u16, node: u8) -> Timestamp {
        Timestamp::new(millis, counter, NodeId([node; 8]))
    }

    fn encrypted(millis: u64, node: u8, len: usize) -> EncryptedCrdtMessage {
        EncryptedCrdtMessage::new(ts(millis, 0, node), vec![0xab; len])
    }

    fn change(millis: u64, node: u8, column: &str, value: i64) -> CrdtMessage {
        CrdtMessage {
            timestamp: ts(millis, 0, node),
            change: DbChange::new("todo", Id::from_hash([9; 16]), column, value),
        }
    }

    async fn row_counts(store: &SqliteRelayStore, owner: &OwnerId) -> (i64, i64, i64) {
        let owner = *owner;
        blocking(&store.conn, move |conn| {
            let count = |table: &str| -> Result<i64> {
                Ok(conn.query_row(
                    &format!("SELECT COUNT(*) FROM {} WHERE owner_id = ?1", table),
                    params![owner.as_bytes().as_slice()],
                    |row| row.get(0),
                )?)
            };
            Ok((count("owners")?, count("timestamps")?, count("messages")?))
        })
        .await
        .unwrap()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Relay
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_write_key_first_write_wins() {
        let store = SqliteRelayStore::open_memory().unwrap();
        let first = WriteKey::from_bytes([1; 16]);
        let other = WriteKey::from_bytes([2; 16]);

        assert!(store.validate_write_key(&owner(1), &first).await.unwrap());
        assert!(!store.validate_write_key(&owner(1), &other).await.unwrap());
        assert!(store.validate_write_key(&owner(1), &first).await.unwrap());

        // Independent per owner
        assert!(store.validate_write_key(&owner(2), &other).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_write_key_overwrites() {
        let store = SqliteRelayStore::open_memory().unwrap();
        let first = WriteKey::from_bytes([1; 16]);
        let second = WriteKey::from_bytes([2; 16]);

        store.validate_write_key(&owner(1), &first).await.unwrap();
        store.set_write_key(&owner(1), &second).await.unwrap();

        assert!(!store.validate_write_key(&owner(1), &first).await.unwrap());
        assert!(store.validate_write_key(&owner(1), &second).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_messages_registers_without_key() {
        let store = SqliteRelayStore::open_memory().unwrap();
        store
            .write_messages(&owner(1), &[encrypted(1_000, 1, 4)])
            .await
            .unwrap();

        // Owner row exists but has no key yet; first key still registers.
        let key = WriteKey::from_bytes([7; 16]);
        assert!(store.validate_write_key(&owner(1), &key).await.unwrap());
        assert!(!store
            .validate_write_key(&owner(1), &WriteKey::from_bytes([8; 16]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_idempotent_insert() {
        let store = SqliteRelayStore::open_memory().unwrap();
        let batch = vec![encrypted(1_000, 1, 10), encrypted(2_000, 1, 10)];

        let first = store.write_messages(&owner(1), &batch).await.unwrap();
        assert_eq!(first.inserted, 2);

        let second = store.write_messages(&owner(1), &batch).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.ignored, 2);
        assert_eq!(second.tree, first.tree);
        assert_eq!(store.merkle_tree(&owner(1)).await.unwrap(), first.tree);
        assert_eq!(store.size(&owner(1)).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_tree_matches_folded_timestamps() {
        let store = SqliteRelayStore::open_memory().unwrap();
        let batch = vec![encrypted(1_000, 1, 1), encrypted(90_000, 2, 1)];
        store.write_messages(&owner(1), &batch).await.unwrap();

        let expected = MerkleTree::new()
            .insert(&batch[0].timestamp)
            .insert(&batch[1].timestamp);
        assert_eq!(store.merkle_tree(&owner(1)).await.unwrap(), expected);
        assert!(store.merkle_tree(&owner(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quota_rejection_leaves_storage_unchanged() {
        let store = SqliteRelayStore::open_memory()
            .unwrap()
            .with_policy(QuotaLimit::new(100));

        store
            .write_messages(&owner(1), &[encrypted(1_000, 1, 60)])
            .await
            .unwrap();
        let tree_before = store.merkle_tree(&owner(1)).await.unwrap();
        let counts_before = row_counts(&store, &owner(1)).await;

        let err = store
            .write_messages(&owner(1), &[encrypted(2_000, 1, 30), encrypted(3_000, 1, 30)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::QuotaExceeded { required_bytes: 120, .. }
        ));

        assert_eq!(store.size(&owner(1)).await.unwrap(), 60);
        assert_eq!(store.merkle_tree(&owner(1)).await.unwrap(), tree_before);
        assert_eq!(row_counts(&store, &owner(1)).await, counts_before);
    }

    #[tokio::test]
    async fn test_messages_since_orders_and_excludes() {
        let store = SqliteRelayStore::open_memory().unwrap();
        store
            .write_messages(
                &owner(1),
                &[
                    encrypted(3_000, 2, 1),
                    encrypted(1_000, 1, 1),
                    encrypted(2_000, 1, 1),
                    encrypted(2_000, 2, 1),
                ],
            )
            .await
            .unwrap();

        let all = store.messages_since(&owner(1), 2_000, None).await.unwrap();
        let stamps: Vec<_> = all.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![ts(2_000, 0, 1), ts(2_000, 0, 2), ts(3_000, 0, 2)]);

        let others = store
            .messages_since(&owner(1), 0, Some(NodeId([2; 8])))
            .await
            .unwrap();
        assert!(others.iter().all(|m| m.timestamp.node == NodeId([1; 8])));
        assert_eq!(others.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_owner() {
        let store = SqliteRelayStore::open_memory().unwrap();
        store
            .validate_write_key(&owner(1), &WriteKey::from_bytes([1; 16]))
            .await
            .unwrap();
        store
            .write_messages(&owner(1), &[encrypted(1_000, 1, 8)])
            .await
            .unwrap();
        store
            .write_messages(&owner(2), &[encrypted(1_000, 1, 8)])
            .await
            .unwrap();

        assert!(store.delete_owner(&owner(1)).await.unwrap());
        assert_eq!(store.size(&owner(1)).await.unwrap(), 0);
        assert_eq!(row_counts(&store, &owner(1)).await, (0, 0, 0));
        assert!(store.merkle_tree(&owner(1)).await.unwrap().is_empty());

        // Other tenants untouched; deleting again reports nothing.
        assert_eq!(store.size(&owner(2)).await.unwrap(), 8);
        assert!(!store.delete_owner(&owner(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_policy_allow_list() {
        let store = SqliteRelayStore::open_memory()
            .unwrap()
            .with_policy(AllowList::new([owner(1)]));
        assert!(store.is_owner_allowed(&owner(1)));
        assert!(!store.is_owner_allowed(&owner(2)));
    }

    #[tokio::test]
    async fn test_relay_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let batch = vec![encrypted(1_000, 1, 5)];

        let tree = {
            let store = SqliteRelayStore::open(&path).unwrap();
            store
                .validate_write_key(&owner(1), &WriteKey::from_bytes([1; 16]))
                .await
                .unwrap();
            store.write_messages(&owner(1), &batch).await.unwrap().tree
        };

        let store = SqliteRelayStore::open(&path).unwrap();
        assert_eq!(store.merkle_tree(&owner(1)).await.unwrap(), tree);
        assert_eq!(store.size(&owner(1)).await.unwrap(), 5);
        assert!(!store
            .validate_write_key(&owner(1), &WriteKey::from_bytes([2; 16]))
            .await
            .unwrap());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replica
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_replica_fresh_has_no_clock() {
        let store = SqliteReplicaStore::open_memory().unwrap();
        assert!(store.load_clock().await.unwrap().is_none());

        let clock = ts(0, 0, 1);
        store.save_clock(&clock).await.unwrap();
        let state = store.load_clock().await.unwrap().unwrap();
        assert_eq!(state.timestamp, clock);
        assert!(state.tree.is_empty());
    }

    #[tokio::test]
    async fn test_replica_last_write_wins() {
        let store = SqliteReplicaStore::open_memory().unwrap();
        let newer = change(2_000, 1, "title", 2);
        let older = change(1_000, 2, "title", 1);

        let summary = store
            .apply_messages(&[newer.clone(), older.clone()], &newer.timestamp)
            .await
            .unwrap();
        assert_eq!(summary.cells_updated, 1);
        assert_eq!(summary.newly_seen, 2);

        let key = newer.change.cell_key();
        let (winner, value) = store.cell(&key).await.unwrap().unwrap();
        assert_eq!(winner, newer.timestamp);
        assert_eq!(value, Value::Integer(2));

        // The stale message is still part of history and the tree.
        assert_eq!(store.messages_since(0).await.unwrap().len(), 2);
        let expected = MerkleTree::new()
            .insert(&newer.timestamp)
            .insert(&older.timestamp);
        assert_eq!(store.merkle_tree().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_replica_reapply_is_noop() {
        let store = SqliteReplicaStore::open_memory().unwrap();
        let message = change(1_000, 1, "title", 1);

        let first = store.apply_messages(&[message.clone()], &message.timestamp).await.unwrap();
        let again = store.apply_messages(&[message.clone()], &message.timestamp).await.unwrap();

        assert_eq!(again.cells_updated, 0);
        assert_eq!(again.newly_seen, 0);
        assert_eq!(again.tree, first.tree);
    }

    #[tokio::test]
    async fn test_replica_values_roundtrip() {
        let store = SqliteReplicaStore::open_memory().unwrap();
        let id = Id::from_hash([3; 16]);
        let values = [
            ("a", Value::Null),
            ("b", Value::Integer(-7)),
            ("c", Value::Real(1.5)),
            ("d", Value::Text("hello".into())),
            ("e", Value::Blob(vec![0, 1, 2])),
        ];
        let messages: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, (column, value))| CrdtMessage {
                timestamp: ts(1_000, i as u16, 1),
                change: DbChange::new("notes", id, *column, value.clone()),
            })
            .collect();
        store.apply_messages(&messages, &messages[4].timestamp).await.unwrap();

        let row = store.row("notes", &id).await.unwrap();
        assert_eq!(row.len(), 5);
        for (column, value) in &values {
            assert_eq!(&row[*column], value);
        }
        assert_eq!(store.messages_since(0).await.unwrap(), messages);
    }

    #[tokio::test]
    async fn test_replica_messages_since_watermark() {
        let store = SqliteReplicaStore::open_memory().unwrap();
        let messages = vec![
            change(1_000, 1, "a", 1),
            change(61_000, 1, "b", 2),
            change(121_000, 1, "c", 3),
        ];
        store.apply_messages(&messages, &messages[2].timestamp).await.unwrap();

        let since = store.messages_since(60_000).await.unwrap();
        assert_eq!(since, messages[1..].to_vec());
    }

    #[tokio::test]
    async fn test_replica_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        let message = change(5_000, 1, "title", 9);

        {
            let store = SqliteReplicaStore::open(&path).unwrap();
            store.apply_messages(&[message.clone()], &message.timestamp).await.unwrap();
        }

        let store = SqliteReplicaStore::open(&path).unwrap();
        let clock = store.load_clock().await.unwrap().unwrap();
        assert_eq!(clock.timestamp, message.timestamp);
        assert_eq!(clock.tree, MerkleTree::new().insert(&message.timestamp));
        assert_eq!(store.cells().await.unwrap().len(), 1);
    }
}
