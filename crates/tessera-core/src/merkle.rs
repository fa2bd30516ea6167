//! Merkle search tree over minute buckets.
//!
//! A ternary trie keyed by the base-3 rendering of `millis / 60_000`. Each
//! node stores the XOR of the hashes of every timestamp inserted at or below
//! it. Two replicas holding the same set of timestamps end up with identical
//! trees regardless of insertion order, and walking both trees from the root
//! finds the earliest bucket where they differ in `MERKLE_KEY_DIGITS` steps.
//!
//! XOR is its own inverse, so each leaf also records the timestamps folded
//! into its bucket. Inserting a timestamp the leaf already holds returns the
//! tree unchanged.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

/// Width of one bucket in milliseconds.
pub const MERKLE_BUCKET_MILLIS: u64 = 60_000;

/// Number of base-3 digits in a key. 3^21 minutes covers every 48-bit millis.
pub const MERKLE_KEY_DIGITS: usize = 21;

/// A persistent ternary trie node.
///
/// Insertion copies the path from the root and shares every untouched subtree.
///
/// Equality compares hashes and shape only. Trees decoded from the wire carry
/// no leaf timestamps and are meant for [`diff`], not for further inserts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MerkleTree {
    hash: u32,
    children: [Option<Arc<MerkleTree>>; 3],
    /// Timestamps folded into this bucket; only populated at leaf depth.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    seen: BTreeSet<Timestamp>,
}

impl PartialEq for MerkleTree {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.children == other.children
    }
}

impl Eq for MerkleTree {}

impl MerkleTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble a node from decoded parts.
    pub fn from_parts(hash: u32, children: [Option<MerkleTree>; 3]) -> Self {
        Self {
            hash,
            children: children.map(|c| c.map(Arc::new)),
            seen: BTreeSet::new(),
        }
    }

    /// XOR of every timestamp hash at or below this node.
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Child for a base-3 digit.
    pub fn child(&self, digit: usize) -> Option<&MerkleTree> {
        self.children.get(digit).and_then(|c| c.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.hash == 0 && self.children.iter().all(Option::is_none)
    }

    /// Return a new tree with `timestamp` folded in.
    ///
    /// Idempotent: a timestamp already in the tree leaves it unchanged.
    pub fn insert(&self, timestamp: &Timestamp) -> MerkleTree {
        let key = timestamp_to_key(timestamp.millis);
        if self.contains_key(&key, timestamp) {
            return self.clone();
        }
        self.insert_key(&key, timestamp, timestamp_hash(timestamp))
    }

    /// Whether `timestamp` has been folded into this tree.
    pub fn contains(&self, timestamp: &Timestamp) -> bool {
        self.contains_key(&timestamp_to_key(timestamp.millis), timestamp)
    }

    fn contains_key(&self, key: &[u8], timestamp: &Timestamp) -> bool {
        let mut node = self;
        for &digit in key {
            match node.child(digit as usize) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.seen.contains(timestamp)
    }

    fn insert_key(&self, key: &[u8], timestamp: &Timestamp, hash: u32) -> MerkleTree {
        let mut node = self.clone();
        node.hash ^= hash;
        match key.split_first() {
            Some((&digit, rest)) => {
                let digit = digit as usize;
                let child = node.children[digit].as_deref().cloned().unwrap_or_default();
                node.children[digit] = Some(Arc::new(child.insert_key(rest, timestamp, hash)));
            }
            None => {
                node.seen.insert(*timestamp);
            }
        }
        node
    }

    /// Number of nodes, root included.
    pub fn node_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .flatten()
            .map(|c| c.node_count())
            .sum::<usize>()
    }
}

/// Hash of a single timestamp: the first four bytes of blake3 over its
/// canonical encoding.
pub fn timestamp_hash(timestamp: &Timestamp) -> u32 {
    let digest = blake3::hash(&timestamp.to_bytes());
    let bytes = digest.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Base-3 digits of the minute bucket, most significant first.
pub fn timestamp_to_key(millis: u64) -> [u8; MERKLE_KEY_DIGITS] {
    let mut minutes = millis / MERKLE_BUCKET_MILLIS;
    let mut key = [0u8; MERKLE_KEY_DIGITS];
    for digit in key.iter_mut().rev() {
        *digit = (minutes % 3) as u8;
        minutes /= 3;
    }
    key
}

/// Lower bound in millis of the bucket range named by a key prefix.
///
/// Missing trailing digits count as zero.
pub fn key_to_millis(prefix: &[u8]) -> u64 {
    let minutes = (0..MERKLE_KEY_DIGITS).fold(0u64, |acc, i| {
        acc * 3 + prefix.get(i).copied().unwrap_or(0) as u64
    });
    minutes * MERKLE_BUCKET_MILLIS
}

/// Find the earliest point where two trees diverge.
///
/// Returns `None` when the root hashes match. Otherwise descends into the
/// first child (in digit order 0, 1, 2) whose hash differs, treating a
/// missing child as hash 0, and returns the lower bound of the bucket range
/// reached.
pub fn diff(a: &MerkleTree, b: &MerkleTree) -> Option<u64> {
    if a.hash == b.hash {
        return None;
    }

    let empty = MerkleTree::default();
    let mut left = a;
    let mut right = b;
    let mut key = Vec::with_capacity(MERKLE_KEY_DIGITS);

    while key.len() < MERKLE_KEY_DIGITS {
        let child_hash = |node: &MerkleTree, digit: usize| node.child(digit).map_or(0, |c| c.hash);
        let Some(digit) = (0..3).find(|&d| child_hash(left, d) != child_hash(right, d)) else {
            break;
        };
        key.push(digit as u8);
        left = left.child(digit).unwrap_or(&empty);
        right = right.child(digit).unwrap_or(&empty);
    }

    Some(key_to_millis(&key))
}
