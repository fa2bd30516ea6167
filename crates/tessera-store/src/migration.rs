//! Database schema migrations for SQLite.
//!
//! A simple versioned migration system. Relay and replica databases have
//! separate migration lists; each migration transforms the schema from
//! version N to N+1 and is recorded in `schema_migrations`.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Which database a connection holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    Relay,
    Replica,
}

impl Schema {
    /// Current schema version.
    pub const fn current_version(self) -> u32 {
        match self {
            Schema::Relay => 1,
            Schema::Replica => 1,
        }
    }
}

/// Initialize or migrate the database schema.
///
/// Idempotent: it can be called on every open.
pub fn migrate(conn: &mut Connection, schema: Schema) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    let target = schema.current_version();
    if current < target {
        let tx = conn.transaction()?;

        for version in (current + 1)..=target {
            apply_migration(&tx, schema, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(?schema, from = current, to = target, "migrated schema");
    }

    Ok(())
}

fn apply_migration(conn: &Connection, schema: Schema, version: u32) -> Result<()> {
    match (schema, version) {
        (Schema::Relay, 1) => relay_v1(conn),
        (Schema::Replica, 1) => replica_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown {:?} migration version: {}",
            schema, version
        ))),
    }
}

/// Relay v1: owners, timestamp index, message blobs.
fn relay_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per tenant: write key and tree snapshot
        CREATE TABLE owners (
            owner_id BLOB PRIMARY KEY,        -- 16 bytes
            write_key BLOB,                   -- 16 bytes, NULL until registered
            merkle_tree BLOB NOT NULL,        -- CBOR MerkleTree
            created_at INTEGER NOT NULL
        );

        -- Timestamp index, the insert-or-ignore gate
        CREATE TABLE timestamps (
            owner_id BLOB NOT NULL,
            timestamp BLOB NOT NULL,          -- 16 bytes, byte order = logical order
            PRIMARY KEY (owner_id, timestamp)
        );

        -- Ciphertext blobs
        CREATE TABLE messages (
            owner_id BLOB NOT NULL,
            timestamp BLOB NOT NULL,
            change BLOB NOT NULL,
            PRIMARY KEY (owner_id, timestamp)
        );
        "#,
    )?;

    Ok(())
}

/// Replica v1: clock, history, resolved cells.
fn replica_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Single row: the replica clock and tree snapshot
        CREATE TABLE crdt_clock (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            timestamp BLOB NOT NULL,
            merkle_tree BLOB NOT NULL
        );

        -- Every message ever seen, local or remote
        CREATE TABLE crdt_messages (
            timestamp BLOB PRIMARY KEY,
            table_name TEXT NOT NULL,
            row_id BLOB NOT NULL,
            column_name TEXT NOT NULL,
            value
        );

        -- Winning value per cell
        CREATE TABLE crdt_cells (
            table_name TEXT NOT NULL,
            row_id BLOB NOT NULL,
            column_name TEXT NOT NULL,
            timestamp BLOB NOT NULL,
            value,
            PRIMARY KEY (table_name, row_id, column_name)
        );
        "#,
    )?;

    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
