//! # Tessera Sync
//!
//! Wire protocol, relay and client sync session.
//!
//! ## Overview
//!
//! Clients and the relay exchange one binary request and one binary response
//! per round. The client sends its merkle tree and the encrypted messages the
//! relay may be missing; the relay stores them and answers with its own tree
//! and the messages past the point where the two trees diverge. Rounds repeat
//! until the trees agree.
//!
//! ## Key Properties
//!
//! - **Idempotent**: resending a message changes nothing on either side
//! - **Commutative**: arrival order does not affect the resolved cells
//! - **Resumable**: an interrupted round is recovered by the next tree diff
//! - **Blind relay**: change payloads are padded and sealed before they leave
//!   the client
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessera_core::{NodeId, SystemTimeSource};
//! use tessera_keys::{Owner, OwnerSecret};
//! use tessera_store::MemoryReplicaStore;
//! use tessera_sync::{SyncConfig, SyncSession, WebSocketTransport};
//!
//! async fn example() -> tessera_sync::Result<()> {
//!     let owner = Owner::from_secret(&OwnerSecret::generate());
//!     let session = SyncSession::new(
//!         owner.clone(),
//!         NodeId::random(),
//!         Arc::new(MemoryReplicaStore::new()),
//!         Arc::new(SystemTimeSource),
//!         SyncConfig::default(),
//!     );
//!     let url = WebSocketTransport::owner_url("ws://127.0.0.1:4000", &owner.id);
//!     let transport = WebSocketTransport::connect(&url).await?;
//!     session.sync(&transport, vec![]).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Client                              Relay
//!   |-- Request(tree, messages) ------->|  store, diff(relay, client)
//!   |<------ Response(tree, messages) --|
//!   |   apply, diff(local, relay)       |
//!   |-- Request(messages since w) ----->|  (until trees agree)
//! ```

pub mod change;
pub mod codec;
pub mod convergence;
pub mod error;
pub mod messages;
pub mod padding;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;

pub use change::{
    decode_change, decrypt_messages, encode_change, encrypt_batch, encrypt_messages, open_change,
    seal_change, validate_change,
};
pub use codec::{decode, encode};
pub use convergence::{
    compute_cell_state_hash, latest_cell_timestamp, verify_convergence, ConvergenceResult,
};
pub use error::{ProtocolDecodeError, Result, SyncError, SyncStateError};
pub use messages::{
    limits, Envelope, ErrorCode, MessageType, SyncRequest, SyncResponse, PROTOCOL_VERSION,
};
pub use padding::padded_len;
pub use relay::Relay;
pub use server::RelayServer;
pub use session::{SyncConfig, SyncLock, SyncOutcome, SyncReport, SyncSession, SyncState};
pub use transport::{
    memory::MemoryTransport, websocket::WebSocketTransport, FrameHandler, Transport,
};
