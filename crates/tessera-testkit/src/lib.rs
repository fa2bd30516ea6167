//! # Tessera Testkit
//!
//! Testing utilities for Tessera.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: Byte layouts every replica and relay must agree on
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: An owner, a relay and a manual clock for sync scenarios
//!
//! ## Golden Vectors
//!
//! ```rust
//! use tessera_testkit::vectors::verify_all_vectors;
//!
//! verify_all_vectors().expect("vectors hold");
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use tessera_testkit::generators::{messages, tree_of};
//!
//! proptest! {
//!     #[test]
//!     fn tree_ignores_order(batch in messages(32)) {
//!         let mut reversed = batch.clone();
//!         reversed.reverse();
//!         prop_assert_eq!(tree_of(&batch), tree_of(&reversed));
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,ignore
//! use tessera_core::NodeId;
//! use tessera_testkit::fixtures::TestFixture;
//!
//! let fixture = TestFixture::with_seed([1; 32]);
//! let session = fixture.session(NodeId([1; 8]));
//! let transport = fixture.connect();
//! session.sync(&transport, Vec::new()).await?;
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{multi_replica_sessions, TestFixture, TEST_START_MILLIS};
pub use generators::tree_of;
pub use vectors::{vectors_json, verify_all_vectors};
