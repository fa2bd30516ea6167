//! # Tessera Store
//!
//! Storage for both ends of a sync: the relay, which keeps encrypted
//! messages per tenant, and the replica, which keeps the resolved cells,
//! the full history and the clock of one client.
//!
//! ## Key Types
//!
//! - [`RelayStore`] - Per-tenant message storage, write keys, quota, erasure
//! - [`ReplicaStore`] - Local clock, history and last-write-wins cells
//! - [`OwnerPolicy`] - Admission and quota hooks ([`AllowAll`], [`QuotaLimit`], [`AllowList`])
//! - [`SqliteRelayStore`], [`SqliteReplicaStore`] - SQLite backends
//! - [`MemoryRelayStore`], [`MemoryReplicaStore`] - In-memory backends for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tessera_store::{QuotaLimit, RelayStore, SqliteRelayStore};
//!
//! async fn example() {
//!     let store = SqliteRelayStore::open("relay.db")
//!         .unwrap()
//!         .with_policy(QuotaLimit::new(10 * 1024 * 1024));
//!     // store.write_messages(&owner, &batch).await?;
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent inserts**: a timestamp is stored and folded into the tree once
//! - **All-or-nothing batches**: quota rejection or failure writes nothing
//! - **Tenant isolation**: every relay row is keyed by owner id

pub mod error;
pub mod memory;
pub mod migration;
pub mod policy;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::{MemoryRelayStore, MemoryReplicaStore};
pub use policy::{AllowAll, AllowList, OwnerPolicy, QuotaLimit};
pub use sqlite::{SqliteRelayStore, SqliteReplicaStore};
pub use traits::{batch_bytes, ApplySummary, ClockState, RelayStore, ReplicaStore, WriteOutcome};
