//! Client sync session state machine.
//!
//! A session owns the replica clock and runs sync rounds against the relay:
//!
//! ```text
//! Initial --sync or mutate--> Syncing --trees agree--> Synced { at }
//!                                \------error-------> NotSynced(error)
//! ```
//!
//! Each round sends the local tree plus the messages the relay may lack,
//! applies whatever comes back, and compares trees again. Rounds repeat from
//! the divergence point until the trees agree.
//!
//! Batches are capped by [`limits::BatchBudget`] in both directions. A
//! message sent once is not sent again in the same sync, and a full response
//! is continued with `after` set to its last timestamp, so catching up on
//! more data than one frame carries still makes progress every round.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tessera_core::{
    diff, timestamp, CrdtMessage, DbChange, EncryptedCrdtMessage, NodeId, TimeSource, Timestamp,
    DEFAULT_MAX_DRIFT,
};
use tessera_keys::Owner;
use tessera_store::{ApplySummary, ReplicaStore};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::change::{decrypt_messages, encrypt_batch, validate_change};
use crate::codec;
use crate::error::{Result, SyncError, SyncStateError};
use crate::messages::{limits, Envelope, SyncRequest};
use crate::transport::Transport;

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Initial,
    Syncing,
    /// Trees agreed at wall-clock `at` millis.
    Synced { at: u64 },
    NotSynced(SyncStateError),
}

/// Advisory lock: at most one round per replica at a time.
///
/// Clones share the lock, so several sessions over the same replica can
/// coordinate.
#[derive(Debug, Clone, Default)]
pub struct SyncLock(Arc<Mutex<()>>);

impl SyncLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock without waiting.
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.0).try_lock_owned().ok()
    }

    pub fn is_held(&self) -> bool {
        self.0.try_lock().is_err()
    }
}

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Timeout for waiting for the relay's reply.
    pub message_timeout: Duration,
    /// Rounds before giving up on convergence.
    pub max_rounds: usize,
    /// How far the clock may run ahead of wall-clock time.
    pub max_drift: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(30),
            max_rounds: 8,
            max_drift: DEFAULT_MAX_DRIFT,
        }
    }
}

/// Result of a completed sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub rounds: usize,
    /// Messages sent to the relay.
    pub sent: usize,
    /// Messages received from the relay.
    pub received: usize,
    pub cells_updated: usize,
    /// Received messages not seen before.
    pub newly_seen: usize,
    pub synced_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another round held the lock.
    Skipped,
    Completed(SyncReport),
}

/// Sync session for one replica.
pub struct SyncSession<S> {
    owner: Owner,
    node: NodeId,
    store: Arc<S>,
    time: Arc<dyn TimeSource>,
    config: SyncConfig,
    lock: SyncLock,
    /// Serializes clock updates between local mutations and received batches.
    clock: Mutex<()>,
    state: watch::Sender<SyncState>,
}

impl<S: ReplicaStore> SyncSession<S> {
    pub fn new(
        owner: Owner,
        node: NodeId,
        store: Arc<S>,
        time: Arc<dyn TimeSource>,
        config: SyncConfig,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Initial);
        Self {
            owner,
            node,
            store,
            time,
            config,
            lock: SyncLock::new(),
            clock: Mutex::new(()),
            state,
        }
    }

    /// Share an advisory lock with other sessions.
    pub fn with_lock(mut self, lock: SyncLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn lock(&self) -> &SyncLock {
        &self.lock
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    async fn current_clock(&self) -> Result<Timestamp> {
        Ok(self
            .store
            .load_clock()
            .await?
            .map_or(Timestamp::zero(self.node), |c| c.timestamp))
    }

    /// Stamp local changes and apply them in one transaction.
    ///
    /// On a clock error or a change peers could not decode, nothing is
    /// applied and the clock is unchanged. Publishes [`SyncState::Syncing`]
    /// once the changes are waiting to be sent.
    pub async fn mutate(&self, changes: Vec<DbChange>) -> Result<Vec<CrdtMessage>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        for change in &changes {
            validate_change(change)?;
        }

        let _clock = self.clock.lock().await;
        let mut clock = self.current_clock().await?;
        let now = self.time.now_millis();

        let mut messages = Vec::with_capacity(changes.len());
        for change in changes {
            clock = timestamp::send(&clock, now, self.node, self.config.max_drift)?;
            messages.push(CrdtMessage {
                timestamp: clock,
                change,
            });
        }

        self.store.apply_messages(&messages, &clock).await?;
        debug!(count = messages.len(), %clock, "applied local changes");
        self.state.send_replace(SyncState::Syncing);
        Ok(messages)
    }

    /// Run sync rounds until the local and relay trees agree.
    ///
    /// `outgoing` are local messages not yet known to reach the relay.
    /// Returns [`SyncOutcome::Skipped`] if another round holds the lock.
    pub async fn sync(
        &self,
        transport: &dyn Transport,
        outgoing: Vec<CrdtMessage>,
    ) -> Result<SyncOutcome> {
        let Some(_guard) = self.lock.try_acquire() else {
            debug!(owner = %self.owner.id, "sync already running, skipping");
            return Ok(SyncOutcome::Skipped);
        };

        self.state.send_replace(SyncState::Syncing);
        match self.run(transport, outgoing).await {
            Ok(report) => {
                info!(
                    owner = %self.owner.id,
                    rounds = report.rounds,
                    sent = report.sent,
                    received = report.received,
                    "synced"
                );
                self.state.send_replace(SyncState::Synced {
                    at: report.synced_at,
                });
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                warn!(owner = %self.owner.id, error = %e, "sync failed");
                self.state
                    .send_replace(SyncState::NotSynced(SyncStateError::from(&e)));
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        transport: &dyn Transport,
        mut outgoing: Vec<CrdtMessage>,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut previous_watermark = None;
        let mut sent = HashSet::new();
        let mut after = None;
        // Rounds where both batches fit whole; only these count toward max_rounds.
        let mut settled_rounds = 0;

        loop {
            report.rounds += 1;
            let round = report.rounds;

            let batch = encrypt_batch(&outgoing, &self.owner.encryption_key)?;
            let sent_partial = batch.len() < outgoing.len();
            let sent_any = !batch.is_empty();
            sent.extend(batch.iter().map(|m| m.timestamp));
            let request = SyncRequest {
                owner: self.owner.id,
                write_key: Some(self.owner.write_key),
                after,
                node: self.node,
                messages: batch,
                tree: self.store.merkle_tree().await?,
            };
            report.sent += request.messages.len();
            transport
                .send(codec::encode(&Envelope::Request(request)))
                .await?;

            let frame = transport
                .recv_timeout(self.config.message_timeout)
                .await?
                .ok_or_else(|| SyncError::Timeout("waiting for sync response".into()))?;
            let response = match codec::decode(&frame)? {
                Envelope::Response(response) => response,
                Envelope::Error { code, .. } => return Err(SyncError::Relay(code)),
                Envelope::Request(_) => {
                    return Err(SyncError::UnexpectedMessage("request from relay".into()))
                }
            };
            if response.owner != self.owner.id {
                return Err(SyncError::UnexpectedMessage(format!(
                    "response for owner {}",
                    response.owner
                )));
            }

            let received_full = limits::is_full_batch(&response.messages);
            after = if received_full {
                response.messages.last().map(|m| m.timestamp)
            } else {
                None
            };
            report.received += response.messages.len();
            let summary = self.receive(&response.messages).await?;
            report.cells_updated += summary.cells_updated;
            report.newly_seen += summary.newly_seen;

            let Some(watermark) = diff(&summary.tree, &response.tree) else {
                report.synced_at = self.time.now_millis();
                return Ok(report);
            };
            debug!(round, watermark, sent_partial, received_full, "trees differ");

            if !sent_partial && !received_full {
                let stalled = previous_watermark == Some(watermark)
                    && summary.newly_seen == 0
                    && !sent_any;
                if stalled {
                    return Err(SyncError::NoProgress { watermark });
                }
                settled_rounds += 1;
                if settled_rounds >= self.config.max_rounds {
                    return Err(SyncError::TooManyRounds(self.config.max_rounds));
                }
            }
            previous_watermark = Some(watermark);
            outgoing = self
                .store
                .messages_since(watermark)
                .await?
                .into_iter()
                .filter(|m| !sent.contains(&m.timestamp))
                .collect();
        }
    }

    /// Decrypt, advance the clock past every message and merge, atomically.
    async fn receive(&self, messages: &[EncryptedCrdtMessage]) -> Result<ApplySummary> {
        if messages.is_empty() {
            return Ok(ApplySummary {
                tree: self.store.merkle_tree().await?,
                ..Default::default()
            });
        }

        let messages = decrypt_messages(messages, &self.owner.encryption_key)?;

        let _clock = self.clock.lock().await;
        let now = self.time.now_millis();
        let mut clock = self.current_clock().await?;
        for message in &messages {
            clock = timestamp::receive(&clock, &message.timestamp, now, self.config.max_drift)?;
        }
        Ok(self.store.apply_messages(&messages, &clock).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{Id, ManualTime, TimestampError, Value};
    use tessera_keys::OwnerSecret;
    use tessera_store::{MemoryRelayStore, MemoryReplicaStore, QuotaLimit, RelayStore};

    use crate::messages::ErrorCode;
    use crate::relay::Relay;
    use crate::transport::memory::MemoryTransport;

    const START: u64 = 1_700_000_000_000;

    fn owner() -> Owner {
        Owner::from_secret(&OwnerSecret::new([1; 32]))
    }

    fn session(node: u8, time: &Arc<ManualTime>) -> SyncSession<MemoryReplicaStore> {
        SyncSession::new(
            owner(),
            NodeId([node; 8]),
            Arc::new(MemoryReplicaStore::new()),
            Arc::clone(time) as Arc<dyn TimeSource>,
            SyncConfig {
                message_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        )
    }

    fn connect<R: RelayStore + 'static>(relay: &Relay<R>) -> MemoryTransport {
        MemoryTransport::connect(owner().id, Arc::new(relay.clone()))
    }

    fn todo(row: u8, title: &str) -> DbChange {
        DbChange::new("todo", Id::from_hash([row; 16]), "title", title)
    }

    fn completed(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Completed(report) => report,
            SyncOutcome::Skipped => panic!("sync was skipped"),
        }
    }

    #[tokio::test]
    async fn test_mutate_stamps_increasing() {
        let time = Arc::new(ManualTime::new(START));
        let a = session(1, &time);
        let messages = a.mutate(vec![todo(1, "x"), todo(2, "y")]).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].timestamp < messages[1].timestamp);
        assert_eq!(messages[1].timestamp.counter, 1);

        let clock = a.store().load_clock().await.unwrap().unwrap();
        assert_eq!(clock.timestamp, messages[1].timestamp);
    }

    #[tokio::test]
    async fn test_mutate_clock_error_commits_nothing() {
        let time = Arc::new(ManualTime::new(START));
        let a = session(1, &time);
        a.mutate(vec![todo(1, "x")]).await.unwrap();

        // Wall clock jumps far back: the clock would be too far ahead.
        time.set(START - 10 * DEFAULT_MAX_DRIFT);
        let err = a.mutate(vec![todo(1, "y")]).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Timestamp(TimestampError::Drift { .. })
        ));
        let row = a.store().row("todo", &Id::from_hash([1; 16])).await.unwrap();
        assert_eq!(row.get("title"), Some(&Value::from("x")));
        assert_eq!(a.store().messages_since(0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mutate_rejects_undecodable_names() {
        let time = Arc::new(ManualTime::new(START));
        let a = session(1, &time);
        let row = Id::from_hash([1; 16]);

        let longest = "c".repeat(limits::MAX_NAME_BYTES);
        a.mutate(vec![DbChange::new("todo", row, longest.as_str(), "ok")])
            .await
            .unwrap();

        let too_long = "c".repeat(limits::MAX_NAME_BYTES + 1);
        let err = a
            .mutate(vec![
                todo(2, "valid"),
                DbChange::new("todo", row, too_long.as_str(), "bad"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NameTooLong { .. }));
        assert_eq!(a.store().messages_since(0).await.unwrap().len(), 1);
        assert!(a.store().row("todo", &Id::from_hash([2; 16])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mutate_enters_syncing() {
        let time = Arc::new(ManualTime::new(START));
        let relay = Relay::new(Arc::new(MemoryRelayStore::new()));
        let a = session(1, &time);
        assert_eq!(a.state(), SyncState::Initial);

        let messages = a.mutate(vec![todo(1, "x")]).await.unwrap();
        assert_eq!(a.state(), SyncState::Syncing);

        completed(a.sync(&connect(&relay), messages).await.unwrap());
        assert!(matches!(a.state(), SyncState::Synced { .. }));
        a.mutate(vec![todo(1, "y")]).await.unwrap();
        assert_eq!(a.state(), SyncState::Syncing);
    }

    #[tokio::test]
    async fn test_catch_up_larger_than_one_frame() {
        let time = Arc::new(ManualTime::new(START));
        let relay = Relay::new(Arc::new(MemoryRelayStore::new()));
        let config = SyncConfig {
            message_timeout: Duration::from_secs(1),
            max_rounds: 1,
            ..Default::default()
        };
        let replica = |node: u8| {
            SyncSession::new(
                owner(),
                NodeId([node; 8]),
                Arc::new(MemoryReplicaStore::new()),
                Arc::clone(&time) as Arc<dyn TimeSource>,
                config.clone(),
            )
        };
        let a = replica(1);
        let b = replica(2);

        // Same millisecond, so every message lands in one tree bucket.
        let changes = (0..20u8)
            .map(|i| DbChange::new("file", Id::from_hash([i; 16]), "data", vec![i; 900_000]))
            .collect();
        let messages = a.mutate(changes).await.unwrap();

        let report = completed(a.sync(&connect(&relay), messages).await.unwrap());
        assert_eq!(report.sent, 20);
        assert!(report.rounds > 2);

        let report = completed(b.sync(&connect(&relay), vec![]).await.unwrap());
        assert_eq!(report.received, 20);
        assert!(report.rounds > 2);
        assert_eq!(
            a.store().cells().await.unwrap(),
            b.store().cells().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_two_replicas_converge() {
        let time = Arc::new(ManualTime::new(START));
        let relay = Relay::new(Arc::new(MemoryRelayStore::new()));
        let a = session(1, &time);
        let b = session(2, &time);

        let from_a = a.mutate(vec![todo(1, "from a")]).await.unwrap();
        time.advance(90_000);
        let from_b = b
            .mutate(vec![todo(1, "from b"), todo(2, "only b")])
            .await
            .unwrap();

        let report = completed(a.sync(&connect(&relay), from_a).await.unwrap());
        assert_eq!(report.sent, 1);
        let report = completed(b.sync(&connect(&relay), from_b).await.unwrap());
        assert_eq!(report.received, 1);
        completed(a.sync(&connect(&relay), vec![]).await.unwrap());

        assert_eq!(
            a.store().cells().await.unwrap(),
            b.store().cells().await.unwrap()
        );
        let tree_a = a.store().merkle_tree().await.unwrap();
        assert_eq!(tree_a, b.store().merkle_tree().await.unwrap());
        assert_eq!(diff(&tree_a, &relay.store().merkle_tree(&owner().id).await.unwrap()), None);

        // The later write wins on both sides.
        let row = a.store().row("todo", &Id::from_hash([1; 16])).await.unwrap();
        assert_eq!(row.get("title"), Some(&Value::from("from b")));
        assert!(matches!(a.state(), SyncState::Synced { .. }));
    }

    #[tokio::test]
    async fn test_lost_outgoing_messages_recovered_from_diff() {
        let time = Arc::new(ManualTime::new(START));
        let relay = Relay::new(Arc::new(MemoryRelayStore::new()));
        let a = session(1, &time);
        let b = session(2, &time);

        a.mutate(vec![todo(1, "forgotten")]).await.unwrap();
        // Nothing passed as outgoing: the tree diff finds it.
        let report = completed(a.sync(&connect(&relay), vec![]).await.unwrap());
        assert_eq!(report.rounds, 2);
        assert_eq!(report.sent, 1);

        completed(b.sync(&connect(&relay), vec![]).await.unwrap());
        let row = b.store().row("todo", &Id::from_hash([1; 16])).await.unwrap();
        assert_eq!(row.get("title"), Some(&Value::from("forgotten")));
    }

    #[tokio::test]
    async fn test_skipped_while_locked() {
        let time = Arc::new(ManualTime::new(START));
        let relay = Relay::new(Arc::new(MemoryRelayStore::new()));
        let a = session(1, &time);

        let guard = a.lock().try_acquire().unwrap();
        assert!(a.lock().is_held());
        let outcome = a.sync(&connect(&relay), vec![]).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped);
        assert_eq!(a.state(), SyncState::Initial);
        drop(guard);
        assert!(!a.lock().is_held());
    }

    #[tokio::test]
    async fn test_quota_maps_to_payment_required() {
        let time = Arc::new(ManualTime::new(START));
        let store = MemoryRelayStore::new().with_policy(QuotaLimit::new(1));
        let relay = Relay::new(Arc::new(store));
        let a = session(1, &time);
        let mut states = a.subscribe();

        let messages = a.mutate(vec![todo(1, "x")]).await.unwrap();
        let err = a.sync(&connect(&relay), messages).await.unwrap_err();
        assert!(matches!(err, SyncError::Relay(ErrorCode::QuotaExceeded)));
        assert_eq!(
            a.state(),
            SyncState::NotSynced(SyncStateError::PaymentRequired)
        );
        assert!(states.has_changed().unwrap());
        assert_eq!(
            *states.borrow_and_update(),
            SyncState::NotSynced(SyncStateError::PaymentRequired)
        );
    }

    #[tokio::test]
    async fn test_network_failure_keeps_local_data() {
        let time = Arc::new(ManualTime::new(START));
        let relay = Relay::new(Arc::new(MemoryRelayStore::new()));
        let a = session(1, &time);

        let messages = a.mutate(vec![todo(1, "offline")]).await.unwrap();
        let transport = connect(&relay);
        transport.set_offline(true);
        let err = a.sync(&transport, messages).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert!(matches!(
            a.state(),
            SyncState::NotSynced(SyncStateError::Network(_))
        ));
        assert_eq!(a.store().messages_since(0).await.unwrap().len(), 1);

        // Back online, the next round succeeds.
        transport.set_offline(false);
        completed(a.sync(&transport, vec![]).await.unwrap());
        assert!(relay.store().size(&owner().id).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_write_key_mismatch_is_server_error() {
        let time = Arc::new(ManualTime::new(START));
        let relay = Relay::new(Arc::new(MemoryRelayStore::new()));
        relay
            .store()
            .set_write_key(&owner().id, &tessera_core::WriteKey::from_bytes([0; 16]))
            .await
            .unwrap();
        let a = session(1, &time);

        let messages = a.mutate(vec![todo(1, "x")]).await.unwrap();
        a.sync(&connect(&relay), messages).await.unwrap_err();
        assert_eq!(
            a.state(),
            SyncState::NotSynced(SyncStateError::Server(ErrorCode::WriteKeyMismatch))
        );
    }
}
