//! Hybrid logical clock.
//!
//! Every mutation is stamped with a [`Timestamp`]. Timestamps are globally
//! unique (the node id is part of the value) and totally ordered by
//! `(millis, counter, node)`. The canonical 16-byte encoding sorts the same
//! way as the logical order, so stores can index and range-scan the raw bytes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, TimestampError};
use crate::types::NodeId;

/// Largest representable millis value (48 bits).
pub const MAX_MILLIS: u64 = (1 << 48) - 1;

/// Size of the canonical byte encoding: 6 millis + 2 counter + 8 node.
pub const TIMESTAMP_BYTES: usize = 16;

/// Default tolerated distance between the clock and wall time (5 minutes).
pub const DEFAULT_MAX_DRIFT: u64 = 5 * 60 * 1000;

/// A hybrid logical clock value.
///
/// Field order matters: the derived `Ord` compares millis, then counter,
/// then node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub millis: u64,
    pub counter: u16,
    pub node: NodeId,
}

impl Timestamp {
    pub const fn new(millis: u64, counter: u16, node: NodeId) -> Self {
        Self {
            millis,
            counter,
            node,
        }
    }

    /// The initial clock of a fresh replica.
    pub const fn zero(node: NodeId) -> Self {
        Self::new(0, 0, node)
    }

    /// The smallest timestamp at `millis`; used as a range lower bound.
    pub const fn watermark(millis: u64) -> Self {
        Self::new(millis, 0, NodeId::ZERO)
    }

    /// Encode to the canonical big-endian form.
    pub fn to_bytes(&self) -> [u8; TIMESTAMP_BYTES] {
        let mut out = [0u8; TIMESTAMP_BYTES];
        out[..6].copy_from_slice(&self.millis.to_be_bytes()[2..]);
        out[6..8].copy_from_slice(&self.counter.to_be_bytes());
        out[8..].copy_from_slice(&self.node.0);
        out
    }

    /// Decode from the canonical form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() != TIMESTAMP_BYTES {
            return Err(CoreError::InvalidTimestamp(format!(
                "expected {} bytes, got {}",
                TIMESTAMP_BYTES,
                bytes.len()
            )));
        }
        let mut millis = [0u8; 8];
        millis[2..].copy_from_slice(&bytes[..6]);
        let counter = u16::from_be_bytes([bytes[6], bytes[7]]);
        let mut node = [0u8; 8];
        node.copy_from_slice(&bytes[8..]);
        Ok(Self::new(u64::from_be_bytes(millis), counter, NodeId(node)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:015}-{:04X}-{}", self.millis, self.counter, self.node)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self)
    }
}

/// Stamp a local mutation.
///
/// The result is strictly greater than `local`. Fails when the clock would
/// run more than `max_drift` ahead of `now`, or when more than 65536 events
/// land in the same millisecond.
pub fn send(
    local: &Timestamp,
    now: u64,
    node: NodeId,
    max_drift: u64,
) -> Result<Timestamp, TimestampError> {
    let next = now.max(local.millis);
    check_drift(next, now, max_drift)?;
    check_range(next)?;

    let counter = if next == local.millis {
        increment(local.counter)?
    } else {
        0
    };

    Ok(Timestamp::new(next, counter, node))
}

/// Advance the local clock past a remote timestamp.
///
/// The returned timestamp keeps the local node id: it is the replica's new
/// clock, not the identity of the remote message.
pub fn receive(
    local: &Timestamp,
    remote: &Timestamp,
    now: u64,
    max_drift: u64,
) -> Result<Timestamp, TimestampError> {
    if local.node == remote.node {
        return Err(TimestampError::DuplicateNode { node: local.node });
    }

    let next = now.max(local.millis).max(remote.millis);
    check_drift(next, now, max_drift)?;
    check_range(next)?;

    let counter = match (next == local.millis, next == remote.millis) {
        (true, true) => increment(local.counter.max(remote.counter))?,
        (true, false) => increment(local.counter)?,
        (false, true) => increment(remote.counter)?,
        (false, false) => 0,
    };

    Ok(Timestamp::new(next, counter, local.node))
}

fn check_drift(next: u64, now: u64, max_drift: u64) -> Result<(), TimestampError> {
    if next.saturating_sub(now) > max_drift {
        return Err(TimestampError::Drift { now, next });
    }
    Ok(())
}

fn check_range(millis: u64) -> Result<(), TimestampError> {
    if millis > MAX_MILLIS {
        return Err(TimestampError::TimeOutOfRange { millis });
    }
    Ok(())
}

fn increment(counter: u16) -> Result<u16, TimestampError> {
    counter.checked_add(1).ok_or(TimestampError::CounterOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const NODE_A: NodeId = NodeId([0xaa; 8]);
    const NODE_B: NodeId = NodeId([0xbb; 8]);
    const DRIFT: u64 = 5_000;

    #[test]
    fn test_send_uses_wall_clock_when_ahead() {
        let local = Timestamp::new(1_000, 7, NODE_A);
        let next = send(&local, 2_000, NODE_A, DRIFT).unwrap();
        assert_eq!(next, Timestamp::new(2_000, 0, NODE_A));
    }

    #[test]
    fn test_send_increments_counter_when_clock_stalls() {
        let local = Timestamp::new(2_000, 7, NODE_A);
        let next = send(&local, 1_500, NODE_A, DRIFT).unwrap();
        assert_eq!(next, Timestamp::new(2_000, 8, NODE_A));
        assert!(next > local);
    }

    #[test]
    fn test_send_drift_boundary() {
        let local = Timestamp::new(10_000, 0, NODE_A);
        // drift exactly equal to max succeeds
        assert!(send(&local, 10_000 - DRIFT, NODE_A, DRIFT).is_ok());
        let err = send(&local, 10_000 - DRIFT - 1, NODE_A, DRIFT).unwrap_err();
        assert_eq!(
            err,
            TimestampError::Drift {
                now: 10_000 - DRIFT - 1,
                next: 10_000
            }
        );
    }

    #[test]
    fn test_send_counter_overflow() {
        let local = Timestamp::new(1_000, 65_534, NODE_A);
        let next = send(&local, 1_000, NODE_A, DRIFT).unwrap();
        assert_eq!(next.counter, 65_535);
        assert_eq!(
            send(&next, 1_000, NODE_A, DRIFT).unwrap_err(),
            TimestampError::CounterOverflow
        );
    }

    #[test]
    fn test_send_out_of_range() {
        let local = Timestamp::zero(NODE_A);
        assert!(matches!(
            send(&local, MAX_MILLIS + 1, NODE_A, DRIFT),
            Err(TimestampError::TimeOutOfRange { .. })
        ));
    }

    #[test]
    fn test_receive_duplicate_node() {
        let local = Timestamp::new(1_000, 0, NODE_A);
        let remote = Timestamp::new(2_000, 0, NODE_A);
        assert_eq!(
            receive(&local, &remote, 1_000, DRIFT).unwrap_err(),
            TimestampError::DuplicateNode { node: NODE_A }
        );
    }

    #[test]
    fn test_receive_counter_rules() {
        let local = Timestamp::new(1_000, 3, NODE_A);

        // all equal: max counter + 1
        let remote = Timestamp::new(1_000, 9, NODE_B);
        assert_eq!(
            receive(&local, &remote, 500, DRIFT).unwrap(),
            Timestamp::new(1_000, 10, NODE_A)
        );

        // local wins
        let remote = Timestamp::new(900, 9, NODE_B);
        assert_eq!(
            receive(&local, &remote, 500, DRIFT).unwrap(),
            Timestamp::new(1_000, 4, NODE_A)
        );

        // remote wins
        let remote = Timestamp::new(1_200, 9, NODE_B);
        assert_eq!(
            receive(&local, &remote, 500, DRIFT).unwrap(),
            Timestamp::new(1_200, 10, NODE_A)
        );

        // wall clock wins
        assert_eq!(
            receive(&local, &remote, 3_000, DRIFT).unwrap(),
            Timestamp::new(3_000, 0, NODE_A)
        );
    }

    #[test]
    fn test_receive_drift() {
        let local = Timestamp::new(1_000, 0, NODE_A);
        let remote = Timestamp::new(1_000 + DRIFT + 1, 0, NODE_B);
        assert!(matches!(
            receive(&local, &remote, 1_000, DRIFT),
            Err(TimestampError::Drift { .. })
        ));
        let remote = Timestamp::new(1_000 + DRIFT, 0, NODE_B);
        assert!(receive(&local, &remote, 1_000, DRIFT).is_ok());
    }

    #[test]
    fn test_receive_counter_overflow() {
        let local = Timestamp::new(1_000, 65_535, NODE_A);
        let remote = Timestamp::new(1_000, 0, NODE_B);
        assert_eq!(
            receive(&local, &remote, 1_000, DRIFT).unwrap_err(),
            TimestampError::CounterOverflow
        );
    }

    #[test]
    fn test_display() {
        let ts = Timestamp::new(1_700_000_000_000, 0x1f, NODE_A);
        assert_eq!(ts.to_string(), "001700000000000-001F-aaaaaaaaaaaaaaaa");
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(Timestamp::from_bytes(&[0u8; 15]).is_err());
    }

    fn timestamp() -> impl Strategy<Value = Timestamp> {
        (0..=MAX_MILLIS, any::<u16>(), any::<[u8; 8]>())
            .prop_map(|(millis, counter, node)| Timestamp::new(millis, counter, NodeId(node)))
    }

    proptest! {
        #[test]
        fn test_byte_order_matches_logical_order(a in timestamp(), b in timestamp()) {
            prop_assert_eq!(a.cmp(&b), a.to_bytes().cmp(&b.to_bytes()));
        }

        #[test]
        fn test_bytes_roundtrip(a in timestamp()) {
            prop_assert_eq!(Timestamp::from_bytes(&a.to_bytes()).unwrap(), a);
        }

        #[test]
        fn test_send_is_monotonic(
            millis in 0u64..1_000_000,
            counter in 0u16..u16::MAX,
            now in 0u64..1_000_000,
        ) {
            let local = Timestamp::new(millis, counter, NODE_A);
            if let Ok(next) = send(&local, now, NODE_A, u64::MAX) {
                prop_assert!(next > local);
            }
        }

        #[test]
        fn test_total_order(a in timestamp(), b in timestamp(), c in timestamp()) {
            if a != b {
                prop_assert!((a < b) ^ (b < a));
            }
            if a < b && b < c {
                prop_assert!(a < c);
            }
        }
    }
}
