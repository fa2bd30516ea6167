//! # Tessera
//!
//! Local-first replicas that sync end-to-end encrypted, column-level changes
//! through a blind relay.
//!
//! ## Overview
//!
//! - **Replica**: a client's full copy of an owner's data, readable offline
//! - **Changes**: one column of one row, stamped with a hybrid logical clock
//! - **Merge**: per cell, the change with the greatest timestamp wins
//! - **Sync**: merkle trees over minute buckets find where replicas diverge
//! - **Relay**: stores sealed changes per owner; never sees plaintext
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessera::{Replica, ReplicaConfig};
//! use tessera::core::SystemTimeSource;
//! use tessera::keys::{Owner, OwnerSecret};
//! use tessera::store::SqliteReplicaStore;
//! use tessera::sync::WebSocketTransport;
//!
//! async fn example() -> tessera::Result<()> {
//!     let owner = Owner::from_secret(&OwnerSecret::generate());
//!     let store = SqliteReplicaStore::open("replica.db")?;
//!     let replica =
//!         Replica::open(owner, store, Arc::new(SystemTimeSource), ReplicaConfig::default())
//!             .await?;
//!
//!     let id = replica.insert("todo", [("title", "buy milk")]).await?;
//!
//!     let url = WebSocketTransport::owner_url("ws://127.0.0.1:4000", &replica.owner().id);
//!     let transport = WebSocketTransport::connect(&url).await?;
//!     replica.sync(&transport).await?;
//!
//!     let row = replica.row("todo", id).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `tessera::core` - Clock, merkle tree, merge, identifiers
//! - `tessera::keys` - Owner secret and derived keys
//! - `tessera::store` - Relay and replica storage
//! - `tessera::sync` - Wire protocol, relay handler, sync session

pub mod config;
pub mod error;
pub mod relay;
pub mod replica;

pub use tessera_core as core;
pub use tessera_keys as keys;
pub use tessera_store as store;
pub use tessera_sync as sync;

pub use config::RelayConfig;
pub use error::{Result, TesseraError};
pub use replica::{Replica, ReplicaConfig};

pub use tessera_core::{DbChange, Id, NodeId, OwnerId, Timestamp, Value};
pub use tessera_keys::{Owner, OwnerSecret};
pub use tessera_sync::{SyncOutcome, SyncReport, SyncState};
