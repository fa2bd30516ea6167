//! Sync protocol message types.
//!
//! One request and one response per round. The client sends its tree and
//! whatever messages the relay may be missing; the relay answers with its
//! own tree and the messages past the point where the two trees diverge.

use tessera_core::{EncryptedCrdtMessage, MerkleTree, NodeId, OwnerId, Timestamp, WriteKey};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame size limits.
pub mod limits {
    /// Max messages in one request or response.
    pub const MAX_MESSAGES_PER_FRAME: usize = 10_000;
    /// Max ciphertext length of a single change.
    pub const MAX_CHANGE_BYTES: usize = 1024 * 1024;
    /// Max length of a table or column name.
    pub const MAX_NAME_BYTES: usize = 1024;
    /// Max total ciphertext in one request or response, unless a single
    /// message is larger on its own.
    pub const MAX_BATCH_BYTES: usize = 8 * 1024 * 1024;
    /// Max WebSocket message size accepted by either end. Leaves room for
    /// a full batch plus the tree.
    pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

    /// Running count and size of a batch being filled.
    #[derive(Debug, Default)]
    pub struct BatchBudget {
        count: usize,
        bytes: usize,
    }

    impl BatchBudget {
        /// Admit one more message of `len` ciphertext bytes, if it fits.
        ///
        /// The first message is always admitted.
        pub fn admit(&mut self, len: usize) -> bool {
            if self.count >= MAX_MESSAGES_PER_FRAME
                || (self.count > 0 && self.bytes + len > MAX_BATCH_BYTES)
            {
                return false;
            }
            self.count += 1;
            self.bytes += len;
            true
        }

        /// Whether the batch may have been cut short: another message of
        /// up to [`MAX_CHANGE_BYTES`] might not have fit.
        pub fn is_full(&self) -> bool {
            self.count >= MAX_MESSAGES_PER_FRAME
                || self.bytes + MAX_CHANGE_BYTES > MAX_BATCH_BYTES
        }
    }

    /// [`BatchBudget::is_full`] for a received batch.
    pub fn is_full_batch(messages: &[super::EncryptedCrdtMessage]) -> bool {
        let budget = BatchBudget {
            count: messages.len(),
            bytes: messages.iter().map(|m| m.change.len()).sum(),
        };
        budget.is_full()
    }
}

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Error = 2,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Response),
            2 => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// Error codes carried by error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// Write key does not match the registered key.
    WriteKeyMismatch = 1,
    /// The quota policy rejected the batch.
    QuotaExceeded = 2,
    /// The owner policy rejected the tenant.
    OwnerNotAllowed = 3,
    /// Storage failed; retry on the next round.
    StorageFailure = 4,
    /// Protocol version not supported.
    UnsupportedVersion = 5,
    /// Frame owner differs from the connection owner.
    OwnerMismatch = 6,
    /// Messages sent without a write key.
    MissingWriteKey = 7,
}

impl ErrorCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ErrorCode::WriteKeyMismatch),
            2 => Some(ErrorCode::QuotaExceeded),
            3 => Some(ErrorCode::OwnerNotAllowed),
            4 => Some(ErrorCode::StorageFailure),
            5 => Some(ErrorCode::UnsupportedVersion),
            6 => Some(ErrorCode::OwnerMismatch),
            7 => Some(ErrorCode::MissingWriteKey),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Client to relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub owner: OwnerId,
    /// Required whenever `messages` is non-empty.
    pub write_key: Option<WriteKey>,
    /// Resume point within a round sequence: the last message of the
    /// previous, full response. The relay skips messages up to and including it.
    pub after: Option<Timestamp>,
    /// The requester; the relay leaves its messages out of the response.
    pub node: NodeId,
    pub messages: Vec<EncryptedCrdtMessage>,
    pub tree: MerkleTree,
}

/// Relay to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResponse {
    pub owner: OwnerId,
    pub messages: Vec<EncryptedCrdtMessage>,
    pub tree: MerkleTree,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Request(SyncRequest),
    Response(SyncResponse),
    Error { owner: OwnerId, code: ErrorCode },
}

impl Envelope {
    pub fn owner(&self) -> &OwnerId {
        match self {
            Envelope::Request(r) => &r.owner,
            Envelope::Response(r) => &r.owner,
            Envelope::Error { owner, .. } => owner,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::Request(_) => MessageType::Request,
            Envelope::Response(_) => MessageType::Response,
            Envelope::Error { .. } => MessageType::Error,
        }
    }
}
