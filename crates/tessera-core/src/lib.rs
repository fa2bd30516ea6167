//! # Tessera Core
//!
//! Pure primitives for Tessera's CRDT synchronization: the hybrid logical
//! clock, the merkle search tree, and last-write-wins merge.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Timestamp`] - Hybrid logical clock value, totally ordered
//! - [`MerkleTree`] - Persistent ternary trie of XOR-ed timestamp hashes
//! - [`ReplicaState`] - In-memory resolved cells + history + tree
//! - [`Id`], [`OwnerId`], [`NodeId`] - Identifiers
//!
//! ## Flow
//!
//! A local change is stamped with [`timestamp::send`], merged with
//! [`ReplicaState::apply`] (or a store doing the same in SQL) and folded into
//! the tree. Remote changes advance the clock with [`timestamp::receive`]
//! before they are merged. [`merkle::diff`] tells two replicas where their
//! histories start to differ.

pub mod error;
pub mod merge;
pub mod merkle;
pub mod message;
pub mod time;
pub mod timestamp;
pub mod types;

pub use error::{CoreError, TimestampError};
pub use merge::{decide, ApplyOutcome, MergeDecision, ReplicaState};
pub use merkle::{diff, MerkleTree, MERKLE_BUCKET_MILLIS, MERKLE_KEY_DIGITS};
pub use message::{
    CellKey, CrdtMessage, DbChange, EncryptedCrdtMessage, Value, IS_DELETED_COLUMN,
};
pub use time::{ManualTime, SystemTimeSource, TimeSource};
pub use timestamp::{Timestamp, DEFAULT_MAX_DRIFT, MAX_MILLIS, TIMESTAMP_BYTES};
pub use types::{Id, NodeId, OwnerId, WriteKey};
