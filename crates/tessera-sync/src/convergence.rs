//! Convergence verification.
//!
//! After syncing, replicas can check they hold the same resolved state by
//! comparing deterministic state hashes, and locate the earliest point of
//! disagreement through their trees.

use bytes::BufMut;
use tessera_core::{diff, Timestamp};
use tessera_store::ReplicaStore;

use crate::change::put_value;
use crate::codec::put_str;
use crate::error::Result;

/// Deterministic hash of every resolved cell.
///
/// Algorithm:
/// 1. Take all cells in key order (table, row, column)
/// 2. Feed key, winning timestamp and value into one Blake3 hasher
/// 3. Return the digest
pub async fn compute_cell_state_hash<S: ReplicaStore + ?Sized>(store: &S) -> Result<[u8; 32]> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"tessera-cells-v1:");

    let mut buf = Vec::new();
    for (key, timestamp, value) in store.cells().await? {
        buf.clear();
        put_str(&mut buf, &key.table);
        buf.put_slice(key.id.as_bytes());
        put_str(&mut buf, &key.column);
        buf.put_slice(&timestamp.to_bytes());
        put_value(&mut buf, &value);
        hasher.update(&buf);
    }

    Ok(*hasher.finalize().as_bytes())
}

/// Result of convergence verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceResult {
    /// Same history and same resolved cells.
    Converged,
    /// Histories differ from `watermark` millis on (more rounds needed).
    Diverged { watermark: u64 },
    /// Histories agree but resolved cells do not.
    StateMismatch,
}

impl ConvergenceResult {
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged)
    }
}

/// Compare two replicas.
pub async fn verify_convergence<A, B>(local: &A, remote: &B) -> Result<ConvergenceResult>
where
    A: ReplicaStore + ?Sized,
    B: ReplicaStore + ?Sized,
{
    let local_tree = local.merkle_tree().await?;
    let remote_tree = remote.merkle_tree().await?;
    if let Some(watermark) = diff(&local_tree, &remote_tree) {
        return Ok(ConvergenceResult::Diverged { watermark });
    }

    if compute_cell_state_hash(local).await? != compute_cell_state_hash(remote).await? {
        return Ok(ConvergenceResult::StateMismatch);
    }
    Ok(ConvergenceResult::Converged)
}

/// Latest timestamp in a replica's resolved cells, if any.
pub async fn latest_cell_timestamp<S: ReplicaStore + ?Sized>(
    store: &S,
) -> Result<Option<Timestamp>> {
    Ok(store.cells().await?.into_iter().map(|(_, ts, _)| ts).max())
}
