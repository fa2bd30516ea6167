//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: one owner, one relay and a
//! manual clock shared by every replica.

use std::sync::Arc;

use tessera_core::{ManualTime, NodeId, TimeSource};
use tessera_keys::{Owner, OwnerSecret};
use tessera_store::{MemoryRelayStore, MemoryReplicaStore};
use tessera_sync::{MemoryTransport, Relay, SyncConfig, SyncSession};

/// Clock reading every fixture starts at (2023-11-14T22:13:20Z).
pub const TEST_START_MILLIS: u64 = 1_700_000_000_000;

/// A test fixture with an owner, an in-memory relay and a manual clock.
pub struct TestFixture {
    pub owner: Owner,
    pub relay: Relay<MemoryRelayStore>,
    pub time: Arc<ManualTime>,
}

impl TestFixture {
    /// Create a new fixture with a random owner.
    pub fn new() -> Self {
        Self::from_owner(Owner::from_secret(&OwnerSecret::generate()))
    }

    /// Create with a deterministic owner derived from `seed`.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self::from_owner(Owner::from_secret(&OwnerSecret::new(seed)))
    }

    fn from_owner(owner: Owner) -> Self {
        Self {
            owner,
            relay: Relay::new(Arc::new(MemoryRelayStore::new())),
            time: Arc::new(ManualTime::new(TEST_START_MILLIS)),
        }
    }

    pub fn time_source(&self) -> Arc<dyn TimeSource> {
        Arc::clone(&self.time) as Arc<dyn TimeSource>
    }

    /// A session over a fresh in-memory replica.
    pub fn session(&self, node: NodeId) -> SyncSession<MemoryReplicaStore> {
        SyncSession::new(
            self.owner.clone(),
            node,
            Arc::new(MemoryReplicaStore::new()),
            self.time_source(),
            SyncConfig::default(),
        )
    }

    /// An in-process connection to the fixture's relay.
    pub fn connect(&self) -> MemoryTransport {
        MemoryTransport::connect(self.owner.id, Arc::new(self.relay.clone()))
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Sessions for `count` replicas of the same owner, nodes `[1; 8]`,
/// `[2; 8]` and so on.
pub fn multi_replica_sessions(
    fixture: &TestFixture,
    count: u8,
) -> Vec<SyncSession<MemoryReplicaStore>> {
    (1..=count)
        .map(|n| fixture.session(NodeId([n; 8])))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{DbChange, Id};
    use tessera_sync::{verify_convergence, SyncOutcome};

    #[tokio::test]
    async fn test_fixture_replicas_converge() {
        let fixture = TestFixture::with_seed([4; 32]);
        let sessions = multi_replica_sessions(&fixture, 3);
        let transport = fixture.connect();

        let mut outgoing = Vec::new();
        for (i, session) in sessions.iter().enumerate() {
            fixture.time.advance(1_000);
            let row = Id::from_hash([i as u8; 16]);
            outgoing.push(
                session
                    .mutate(vec![DbChange::new("todo", row, "title", "x")])
                    .await
                    .unwrap(),
            );
        }

        for (session, messages) in sessions.iter().zip(outgoing) {
            let outcome = session.sync(&transport, messages).await.unwrap();
            assert!(matches!(outcome, SyncOutcome::Completed(_)));
        }
        for session in &sessions {
            session.sync(&transport, Vec::new()).await.unwrap();
        }

        for pair in sessions.windows(2) {
            let result = verify_convergence(pair[0].store().as_ref(), pair[1].store().as_ref())
                .await
                .unwrap();
            assert!(result.is_converged(), "{result:?}");
        }
    }
}
