//! Binary wire codec.
//!
//! Big-endian fixed-width integers, unsigned LEB128 varints for counts and
//! lengths. Layout:
//!
//! ```text
//! u8  protocol version
//! u8  message type (0 request, 1 response, 2 error)
//! 16  owner id
//! request:  u8 flags, [16 write key], [16 after], 8 node id, messages, tree
//!           flags bit 0: write key present, bit 1: after present
//! response: messages, tree
//! error:    u8 code
//!
//! messages: varint n, n x (16 timestamp, varint len, len ciphertext)
//! tree:     u32 hash, u8 child mask, present children in digit order
//! ```
//!
//! Decoding is strict: truncation, unknown tags, trailing bytes and frames
//! over the limits all fail.

use bytes::{BufMut, Bytes};
use tessera_core::{
    EncryptedCrdtMessage, Id, MerkleTree, NodeId, OwnerId, Timestamp, WriteKey,
    MERKLE_KEY_DIGITS, TIMESTAMP_BYTES,
};

use crate::error::ProtocolDecodeError;
use crate::messages::{
    limits, Envelope, ErrorCode, MessageType, SyncRequest, SyncResponse, PROTOCOL_VERSION,
};

type DecodeResult<T> = std::result::Result<T, ProtocolDecodeError>;

const FLAG_WRITE_KEY: u8 = 0b01;
const FLAG_AFTER: u8 = 0b10;

// ─────────────────────────────────────────────────────────────────────────────
// Primitives
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub(crate) fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_varint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

/// Bounds-checked cursor over a frame.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        self.buf
    }

    pub(crate) fn take(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(ProtocolDecodeError::Truncated {
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> DecodeResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> DecodeResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> DecodeResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> DecodeResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub(crate) fn varint(&mut self) -> DecodeResult<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            let low = u64::from(byte & 0x7f);
            if shift == 63 && low > 1 {
                return Err(ProtocolDecodeError::VarintOverflow);
            }
            value |= low << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolDecodeError::VarintOverflow)
    }

    /// A varint length checked against `max`.
    pub(crate) fn length(&mut self, max: usize) -> DecodeResult<usize> {
        let len = self.varint()?;
        if len > max as u64 {
            return Err(ProtocolDecodeError::TooLong { len });
        }
        Ok(len as usize)
    }

    pub(crate) fn string(&mut self, max: usize) -> DecodeResult<&'a str> {
        let len = self.length(max)?;
        std::str::from_utf8(self.take(len)?).map_err(|_| ProtocolDecodeError::InvalidUtf8)
    }

    pub(crate) fn id(&mut self) -> DecodeResult<Id> {
        Id::from_bytes(self.array()?).map_err(|e| ProtocolDecodeError::InvalidId(e.to_string()))
    }

    pub(crate) fn finish(self) -> DecodeResult<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolDecodeError::TrailingBytes(self.buf.len()))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Merkle tree
// ─────────────────────────────────────────────────────────────────────────────

pub fn encode_tree(buf: &mut Vec<u8>, tree: &MerkleTree) {
    buf.put_u32(tree.hash());
    let mut mask = 0u8;
    for digit in 0..3 {
        if tree.child(digit).is_some() {
            mask |= 1 << digit;
        }
    }
    buf.put_u8(mask);
    for digit in 0..3 {
        if let Some(child) = tree.child(digit) {
            encode_tree(buf, child);
        }
    }
}

fn decode_tree(reader: &mut Reader<'_>, depth: usize) -> DecodeResult<MerkleTree> {
    let hash = reader.u32()?;
    let mask = reader.u8()?;
    if mask & !0b111 != 0 {
        return Err(ProtocolDecodeError::InvalidChildMask(mask));
    }
    if mask != 0 && depth >= MERKLE_KEY_DIGITS {
        return Err(ProtocolDecodeError::TreeTooDeep);
    }

    let mut children: [Option<MerkleTree>; 3] = Default::default();
    for (digit, slot) in children.iter_mut().enumerate() {
        if mask & (1 << digit) != 0 {
            *slot = Some(decode_tree(reader, depth + 1)?);
        }
    }
    Ok(MerkleTree::from_parts(hash, children))
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

fn encode_messages(buf: &mut Vec<u8>, messages: &[EncryptedCrdtMessage]) {
    put_varint(buf, messages.len() as u64);
    for message in messages {
        buf.put_slice(&message.timestamp.to_bytes());
        put_varint(buf, message.change.len() as u64);
        buf.put_slice(&message.change);
    }
}

fn decode_messages(reader: &mut Reader<'_>) -> DecodeResult<Vec<EncryptedCrdtMessage>> {
    let count = reader.varint()?;
    if count > limits::MAX_MESSAGES_PER_FRAME as u64 {
        return Err(ProtocolDecodeError::TooManyMessages { count });
    }

    // Each message takes at least 17 bytes; don't trust `count` for capacity.
    let capacity = (count as usize).min(reader.remaining().len() / (TIMESTAMP_BYTES + 1));
    let mut messages = Vec::with_capacity(capacity);
    for _ in 0..count {
        let timestamp = Timestamp::from_bytes(reader.take(TIMESTAMP_BYTES)?)
            .map_err(|e| ProtocolDecodeError::InvalidTimestamp(e.to_string()))?;
        let len = reader.length(limits::MAX_CHANGE_BYTES)?;
        let change = Bytes::copy_from_slice(reader.take(len)?);
        messages.push(EncryptedCrdtMessage { timestamp, change });
    }
    Ok(messages)
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Encode a frame.
///
/// Callers fill message batches through [`limits::BatchBudget`]; the peer
/// rejects frames over [`limits::MAX_MESSAGES_PER_FRAME`] and the transport
/// drops frames over [`limits::MAX_FRAME_BYTES`].
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(envelope.message_type() as u8);
    buf.put_slice(envelope.owner().as_bytes());

    match envelope {
        Envelope::Request(request) => {
            let mut flags = 0;
            if request.write_key.is_some() {
                flags |= FLAG_WRITE_KEY;
            }
            if request.after.is_some() {
                flags |= FLAG_AFTER;
            }
            buf.put_u8(flags);
            if let Some(key) = &request.write_key {
                buf.put_slice(key.as_bytes());
            }
            if let Some(after) = &request.after {
                buf.put_slice(&after.to_bytes());
            }
            buf.put_slice(request.node.as_bytes());
            encode_messages(&mut buf, &request.messages);
            encode_tree(&mut buf, &request.tree);
        }
        Envelope::Response(response) => {
            encode_messages(&mut buf, &response.messages);
            encode_tree(&mut buf, &response.tree);
        }
        Envelope::Error { code, .. } => buf.put_u8(code.to_u8()),
    }
    buf
}

/// Decode a frame.
pub fn decode(frame: &[u8]) -> DecodeResult<Envelope> {
    let mut reader = Reader::new(frame);

    let version = reader.u8()?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolDecodeError::UnsupportedVersion(version));
    }
    let tag = reader.u8()?;
    let message_type =
        MessageType::from_u8(tag).ok_or(ProtocolDecodeError::UnknownMessageType(tag))?;
    let owner = OwnerId(reader.id()?);

    let envelope = match message_type {
        MessageType::Request => {
            let flags = reader.u8()?;
            if flags & !(FLAG_WRITE_KEY | FLAG_AFTER) != 0 {
                return Err(ProtocolDecodeError::InvalidFlag(flags));
            }
            let write_key = if flags & FLAG_WRITE_KEY != 0 {
                Some(WriteKey::from_bytes(reader.array()?))
            } else {
                None
            };
            let after = if flags & FLAG_AFTER != 0 {
                Some(
                    Timestamp::from_bytes(reader.take(TIMESTAMP_BYTES)?)
                        .map_err(|e| ProtocolDecodeError::InvalidTimestamp(e.to_string()))?,
                )
            } else {
                None
            };
            let node = NodeId::from_bytes(reader.array()?);
            let messages = decode_messages(&mut reader)?;
            let tree = decode_tree(&mut reader, 0)?;
            Envelope::Request(SyncRequest {
                owner,
                write_key,
                after,
                node,
                messages,
                tree,
            })
        }
        MessageType::Response => {
            let messages = decode_messages(&mut reader)?;
            let tree = decode_tree(&mut reader, 0)?;
            Envelope::Response(SyncResponse {
                owner,
                messages,
                tree,
            })
        }
        MessageType::Error => {
            let raw = reader.u8()?;
            let code = ErrorCode::from_u8(raw).ok_or(ProtocolDecodeError::UnknownErrorCode(raw))?;
            Envelope::Error { owner, code }
        }
    };

    reader.finish()?;
    Ok(envelope)
}
