//! Change payload encoding and sealing.
//!
//! Plaintext layout, padded with zero bytes to [`padded_len`]:
//!
//! ```text
//! str table | 16 row id | str column | u8 tag | value
//! tag 0 null, 1 i64, 2 f64 bits, 3 str text, 4 varint len + blob
//! ```
//!
//! The padded plaintext is sealed with the owner's encryption key before it
//! leaves the client; the relay only ever stores the sealed bytes.

use bytes::{BufMut, Bytes};
use tessera_core::{CrdtMessage, DbChange, EncryptedCrdtMessage, Value};
use tessera_keys::{EncryptionKey, SEAL_OVERHEAD};

use crate::codec::{put_str, put_varint, Reader};
use crate::error::{ProtocolDecodeError, Result, SyncError};
use crate::messages::limits;
use crate::padding::padded_len;

const TAG_NULL: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_REAL: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BLOB: u8 = 4;

pub(crate) fn put_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Integer(i) => {
            buf.put_u8(TAG_INTEGER);
            buf.put_i64(*i);
        }
        Value::Real(f) => {
            buf.put_u8(TAG_REAL);
            buf.put_u64(f.to_bits());
        }
        Value::Text(s) => {
            buf.put_u8(TAG_TEXT);
            put_str(buf, s);
        }
        Value::Blob(b) => {
            buf.put_u8(TAG_BLOB);
            put_varint(buf, b.len() as u64);
            buf.put_slice(b);
        }
    }
}

fn read_value(reader: &mut Reader<'_>) -> std::result::Result<Value, ProtocolDecodeError> {
    Ok(match reader.u8()? {
        TAG_NULL => Value::Null,
        TAG_INTEGER => Value::Integer(reader.u64()? as i64),
        TAG_REAL => Value::Real(f64::from_bits(reader.u64()?)),
        TAG_TEXT => Value::Text(reader.string(limits::MAX_CHANGE_BYTES)?.to_string()),
        TAG_BLOB => {
            let len = reader.length(limits::MAX_CHANGE_BYTES)?;
            Value::Blob(reader.take(len)?.to_vec())
        }
        tag => return Err(ProtocolDecodeError::UnknownValueTag(tag)),
    })
}

/// Encode a change to padded plaintext.
pub fn encode_change(change: &DbChange) -> Vec<u8> {
    let mut buf = Vec::new();
    put_str(&mut buf, &change.table);
    buf.put_slice(change.id.as_bytes());
    put_str(&mut buf, &change.column);
    put_value(&mut buf, &change.value);
    buf.resize(padded_len(buf.len()), 0);
    buf
}

/// Decode padded plaintext. Padding must be all zero.
pub fn decode_change(plaintext: &[u8]) -> std::result::Result<DbChange, ProtocolDecodeError> {
    let mut reader = Reader::new(plaintext);
    let table = reader.string(limits::MAX_NAME_BYTES)?.to_string();
    let id = reader.id()?;
    let column = reader.string(limits::MAX_NAME_BYTES)?.to_string();
    let value = read_value(&mut reader)?;

    if reader.remaining().iter().any(|&b| b != 0) {
        return Err(ProtocolDecodeError::NonZeroPadding);
    }

    Ok(DbChange {
        table,
        id,
        column,
        value,
    })
}

fn check_names(change: &DbChange) -> Result<()> {
    for name in [&change.table, &change.column] {
        if name.len() > limits::MAX_NAME_BYTES {
            return Err(SyncError::NameTooLong { len: name.len() });
        }
    }
    Ok(())
}

/// Check that a change can be sealed and that every peer will decode it.
///
/// Run before a change is stamped or committed: a change the decoder
/// rejects would fail every later sync of the owner.
pub fn validate_change(change: &DbChange) -> Result<()> {
    check_names(change)?;
    let len = encode_change(change).len() + SEAL_OVERHEAD;
    if len > limits::MAX_CHANGE_BYTES {
        return Err(SyncError::ChangeTooLarge { len });
    }
    Ok(())
}

/// Encode, pad and seal a change.
pub fn seal_change(change: &DbChange, key: &EncryptionKey) -> Result<Bytes> {
    check_names(change)?;
    let sealed = tessera_keys::seal(&encode_change(change), key)?;
    if sealed.len() > limits::MAX_CHANGE_BYTES {
        return Err(SyncError::ChangeTooLarge { len: sealed.len() });
    }
    Ok(Bytes::from(sealed))
}

/// Open and decode a sealed change.
pub fn open_change(sealed: &[u8], key: &EncryptionKey) -> Result<DbChange> {
    let plaintext = tessera_keys::open(sealed, key)?;
    Ok(decode_change(&plaintext)?)
}

pub fn encrypt_messages(
    messages: &[CrdtMessage],
    key: &EncryptionKey,
) -> Result<Vec<EncryptedCrdtMessage>> {
    messages
        .iter()
        .map(|m| Ok(EncryptedCrdtMessage::new(m.timestamp, seal_change(&m.change, key)?)))
        .collect()
}

/// Seal messages in order until the batch budget is spent.
///
/// Returns a prefix of `messages`; never empty unless `messages` is.
pub fn encrypt_batch(
    messages: &[CrdtMessage],
    key: &EncryptionKey,
) -> Result<Vec<EncryptedCrdtMessage>> {
    let mut budget = limits::BatchBudget::default();
    let mut batch = Vec::new();
    for message in messages {
        let sealed = seal_change(&message.change, key)?;
        if !budget.admit(sealed.len()) {
            break;
        }
        batch.push(EncryptedCrdtMessage::new(message.timestamp, sealed));
    }
    Ok(batch)
}

pub fn decrypt_messages(
    messages: &[EncryptedCrdtMessage],
    key: &EncryptionKey,
) -> Result<Vec<CrdtMessage>> {
    messages
        .iter()
        .map(|m| {
            Ok(CrdtMessage {
                timestamp: m.timestamp,
                change: open_change(&m.change, key)?,
            })
        })
        .collect()
}
