//! Golden test vectors for deterministic verification.
//!
//! These pin the byte layouts that other replicas and relays must agree on.
//! They can be exported as JSON with [`vectors_json`].

use serde::Serialize;
use tessera_core::{Id, NodeId, OwnerId, Timestamp};
use tessera_sync::{codec, padded_len, Envelope, ErrorCode};

/// Padded length for a given plaintext length.
#[derive(Debug, Clone, Serialize)]
pub struct PaddingVector {
    pub len: usize,
    pub padded: usize,
}

pub fn padding_vectors() -> Vec<PaddingVector> {
    [
        (0, 0),
        (1, 1),
        (8, 8),
        (9, 10),
        (11, 12),
        (17, 18),
        (33, 36),
        (100, 104),
        (1000, 1024),
        (1025, 1088),
        (65537, 67584),
        (1048576, 1048576),
        (1048577, 1081344),
    ]
    .into_iter()
    .map(|(len, padded)| PaddingVector { len, padded })
    .collect()
}

/// Timestamp and its 16-byte encoding.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampVector {
    pub name: &'static str,
    pub millis: u64,
    pub counter: u16,
    pub node: [u8; 8],
    /// Expected encoding (hex).
    pub expected: &'static str,
}

pub fn timestamp_vectors() -> Vec<TimestampVector> {
    vec![
        TimestampVector {
            name: "zero",
            millis: 0,
            counter: 0,
            node: [0; 8],
            expected: "00000000000000000000000000000000",
        },
        TimestampVector {
            name: "typical",
            millis: 1_700_000_000_000,
            counter: 0x0102,
            node: [1, 2, 3, 4, 5, 6, 7, 8],
            expected: "018bcfe5680001020102030405060708",
        },
        TimestampVector {
            name: "max",
            millis: tessera_core::MAX_MILLIS,
            counter: u16::MAX,
            node: [0xff; 8],
            expected: "ffffffffffffffffffffffffffffffff",
        },
    ]
}

/// Id bytes and their text form.
#[derive(Debug, Clone, Serialize)]
pub struct IdVector {
    /// Id bytes (hex).
    pub bytes: &'static str,
    pub text: &'static str,
}

pub fn id_vectors() -> Vec<IdVector> {
    vec![
        IdVector {
            bytes: "00000000000000000000000000000000",
            text: "AAAAAAAAAAAAAAAAAAAAA",
        },
        IdVector {
            bytes: "000102030405060708090a0b0c0d0e0c",
            text: "AAECAwQFBgcICQoLDA0OD",
        },
        IdVector {
            bytes: "fffffffffffffffffffffffffffffffc",
            text: "_____________________",
        },
    ]
}

/// An error frame for the all-zero owner.
#[derive(Debug, Clone, Serialize)]
pub struct FrameVector {
    pub name: &'static str,
    /// Expected frame (hex).
    pub expected: &'static str,
}

fn error_frame(code: ErrorCode) -> Vec<u8> {
    codec::encode(&Envelope::Error {
        owner: OwnerId(Id::from_hash([0; 16])),
        code,
    })
}

pub fn frame_vectors() -> Vec<(FrameVector, ErrorCode)> {
    vec![
        (
            FrameVector {
                name: "quota exceeded",
                expected: "010200000000000000000000000000000000000002",
            },
            ErrorCode::QuotaExceeded,
        ),
        (
            FrameVector {
                name: "write key mismatch",
                expected: "010200000000000000000000000000000000000001",
            },
            ErrorCode::WriteKeyMismatch,
        ),
    ]
}

#[derive(Debug, Serialize)]
struct AllVectors {
    padding: Vec<PaddingVector>,
    timestamps: Vec<TimestampVector>,
    ids: Vec<IdVector>,
    frames: Vec<FrameVector>,
}

/// Every vector as pretty-printed JSON.
pub fn vectors_json() -> String {
    let all = AllVectors {
        padding: padding_vectors(),
        timestamps: timestamp_vectors(),
        ids: id_vectors(),
        frames: frame_vectors().into_iter().map(|(v, _)| v).collect(),
    };
    serde_json::to_string_pretty(&all).unwrap_or_default()
}

/// Check every vector against the implementation.
pub fn verify_all_vectors() -> Result<(), String> {
    for v in padding_vectors() {
        let got = padded_len(v.len);
        if got != v.padded {
            return Err(format!("padded_len({}) = {got}, expected {}", v.len, v.padded));
        }
    }

    for v in timestamp_vectors() {
        let ts = Timestamp::new(v.millis, v.counter, NodeId(v.node));
        let got = hex::encode(ts.to_bytes());
        if got != v.expected {
            return Err(format!("timestamp {}: {got}, expected {}", v.name, v.expected));
        }
        let back = Timestamp::from_bytes(&ts.to_bytes()).map_err(|e| e.to_string())?;
        if back != ts {
            return Err(format!("timestamp {}: decode mismatch", v.name));
        }
    }

    for v in id_vectors() {
        let bytes: [u8; 16] = hex::decode(v.bytes)
            .map_err(|e| e.to_string())?
            .try_into()
            .map_err(|_| format!("id {}: wrong length", v.bytes))?;
        let id = Id::from_bytes(bytes).map_err(|e| e.to_string())?;
        if id.to_string() != v.text {
            return Err(format!("id {}: {id}, expected {}", v.bytes, v.text));
        }
        let parsed: Id = v.text.parse().map_err(|e| format!("id {}: {e}", v.text))?;
        if parsed != id {
            return Err(format!("id {}: parse mismatch", v.text));
        }
    }

    for (v, code) in frame_vectors() {
        let got = hex::encode(error_frame(code));
        if got != v.expected {
            return Err(format!("frame {}: {got}, expected {}", v.name, v.expected));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vectors_hold() {
        verify_all_vectors().unwrap();
    }

    #[test]
    fn test_vectors_export_as_json() {
        let json: serde_json::Value = serde_json::from_str(&vectors_json()).unwrap();
        assert_eq!(json["ids"][0]["text"], "AAAAAAAAAAAAAAAAAAAAA");
        assert_eq!(json["padding"].as_array().unwrap().len(), padding_vectors().len());
    }
}
