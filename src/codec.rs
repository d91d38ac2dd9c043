//! Deterministic serialization of the in-region log (spec §4.3).
//!
//! Fixed-width little-endian framing:
//!
//! ```text
//! LogBook  := last_id:i64 | entry_count:u32 | entry*
//! LogEntry := id:i64 | instance:u128 | timestamp:i64 | message_len:u32 | message
//! ```
//!
//! The framing only needs to be self-consistent across processes built from
//! this implementation; it is not meant to interoperate with any external
//! format.

use bytes::Bytes;
use once_cell::sync::Lazy;

/// One published message plus its delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: i64,
    pub instance: u128,
    /// Monotonic clock reading in nanoseconds (spec §9 "Timestamps").
    pub timestamp: i64,
    pub message: Bytes,
}

/// The single value serialized into the shared region.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogBook {
    pub last_id: i64,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("log book bytes truncated")]
    Truncated,
}

const ID_LEN: usize = 8;
const INSTANCE_LEN: usize = 16;
const TIMESTAMP_LEN: usize = 8;
const MSG_LEN_LEN: usize = 4;
/// Fixed per-entry header size (excludes the variable-length message body).
const ENTRY_HEADER_LEN: usize = ID_LEN + INSTANCE_LEN + TIMESTAMP_LEN + MSG_LEN_LEN;

static ENTRY_OVERHEAD: Lazy<usize> = Lazy::new(|| {
    // Measured once by encoding a sentinel entry with the widest values the
    // codec emits and an empty message, per spec §4.3.
    let sentinel = LogEntry {
        id: i64::MAX,
        instance: u128::MAX,
        timestamp: i64::MAX,
        message: Bytes::new(),
    };
    let mut buf = Vec::new();
    LogBookCodec::encode_entry(&sentinel, &mut buf);
    buf.len()
});

pub struct LogBookCodec;

impl LogBookCodec {
    /// Serialized size of an empty `LogBook`: `last_id:i64` plus the
    /// `entry_count:u32` that `encode` always writes.
    pub const BOOK_HEADER_LEN: usize = ID_LEN + 4;

    /// Serialized length of an empty-message `LogEntry`; the incremental
    /// capacity cost of appending a new entry is `entry_overhead() +
    /// message.len()`.
    pub fn entry_overhead() -> usize {
        *ENTRY_OVERHEAD
    }

    fn encode_entry(entry: &LogEntry, out: &mut Vec<u8>) {
        out.extend_from_slice(&entry.id.to_le_bytes());
        out.extend_from_slice(&entry.instance.to_le_bytes());
        out.extend_from_slice(&entry.timestamp.to_le_bytes());
        out.extend_from_slice(&(entry.message.len() as u32).to_le_bytes());
        out.extend_from_slice(&entry.message);
    }

    pub fn encode(book: &LogBook) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            Self::BOOK_HEADER_LEN + book.entries.len() * ENTRY_HEADER_LEN,
        );
        out.extend_from_slice(&book.last_id.to_le_bytes());
        out.extend_from_slice(&(book.entries.len() as u32).to_le_bytes());
        for entry in &book.entries {
            Self::encode_entry(entry, &mut out);
        }
        out
    }

    /// Encoded size of `book` without allocating: `8` bytes for `last_id`
    /// plus `entry_overhead() + message.len()` per entry.
    pub fn encoded_len(book: &LogBook) -> usize {
        Self::BOOK_HEADER_LEN
            + book
                .entries
                .iter()
                .map(|e| Self::entry_overhead() + e.message.len())
                .sum::<usize>()
    }

    pub fn decode(bytes: &[u8]) -> Result<LogBook, CodecError> {
        if bytes.is_empty() {
            return Ok(LogBook::default());
        }
        if bytes.len() < ID_LEN + 4 {
            return Err(CodecError::Truncated);
        }
        let last_id = i64::from_le_bytes(bytes[0..ID_LEN].try_into().unwrap());
        let count =
            u32::from_le_bytes(bytes[ID_LEN..ID_LEN + 4].try_into().unwrap()) as usize;

        let mut offset = ID_LEN + 4;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            if bytes.len() < offset + ENTRY_HEADER_LEN {
                return Err(CodecError::Truncated);
            }
            let id = i64::from_le_bytes(
                bytes[offset..offset + ID_LEN].try_into().unwrap(),
            );
            offset += ID_LEN;
            let instance = u128::from_le_bytes(
                bytes[offset..offset + INSTANCE_LEN].try_into().unwrap(),
            );
            offset += INSTANCE_LEN;
            let timestamp = i64::from_le_bytes(
                bytes[offset..offset + TIMESTAMP_LEN].try_into().unwrap(),
            );
            offset += TIMESTAMP_LEN;
            let msg_len = u32::from_le_bytes(
                bytes[offset..offset + MSG_LEN_LEN].try_into().unwrap(),
            ) as usize;
            offset += MSG_LEN_LEN;
            if bytes.len() < offset + msg_len {
                return Err(CodecError::Truncated);
            }
            let message = Bytes::copy_from_slice(&bytes[offset..offset + msg_len]);
            offset += msg_len;
            entries.push(LogEntry {
                id,
                instance,
                timestamp,
                message,
            });
        }

        Ok(LogBook { last_id, entries })
    }

    /// Decodes `bytes`, treating any decode failure as the empty log book.
    ///
    /// Used by every reader of the shared region: a half-written length
    /// prefix left by a writer that crashed mid-transform must self-heal on
    /// the next successful write rather than poison the bus (spec §9 Open
    /// Questions).
    pub fn decode_or_default(bytes: &[u8]) -> LogBook {
        match Self::decode(bytes) {
            Ok(book) => book,
            Err(err) => {
                tracing::warn!(%err, "log book failed to decode, treating as empty");
                LogBook::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_stream_decodes_to_empty_book() {
        assert_eq!(LogBookCodec::decode(&[]).unwrap(), LogBook::default());
    }

    #[test]
    fn round_trips_empty_book() {
        let book = LogBook::default();
        let encoded = LogBookCodec::encode(&book);
        assert_eq!(LogBookCodec::decode(&encoded).unwrap(), book);
    }

    #[test]
    fn round_trips_entries_in_order() {
        let book = LogBook {
            last_id: 3,
            entries: vec![
                LogEntry {
                    id: 1,
                    instance: 11,
                    timestamp: 100,
                    message: Bytes::from_static(b"lorem"),
                },
                LogEntry {
                    id: 2,
                    instance: 22,
                    timestamp: 200,
                    message: Bytes::from_static(b"ipsum"),
                },
                LogEntry {
                    id: 3,
                    instance: 33,
                    timestamp: 300,
                    message: Bytes::new(),
                },
            ],
        };
        let encoded = LogBookCodec::encode(&book);
        let decoded = LogBookCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, book);
        assert_eq!(encoded.len(), LogBookCodec::encoded_len(&book));
    }

    #[test]
    fn truncated_stream_is_a_decode_error() {
        let book = LogBook {
            last_id: 1,
            entries: vec![LogEntry {
                id: 1,
                instance: 1,
                timestamp: 1,
                message: Bytes::from_static(b"hi"),
            }],
        };
        let mut encoded = LogBookCodec::encode(&book);
        encoded.truncate(encoded.len() - 1);
        assert_eq!(LogBookCodec::decode(&encoded), Err(CodecError::Truncated));
        // But callers of decode_or_default self-heal instead of panicking.
        assert_eq!(LogBookCodec::decode_or_default(&encoded), LogBook::default());
    }

    #[test]
    fn entry_overhead_is_message_independent() {
        let overhead = LogBookCodec::entry_overhead();
        assert_eq!(overhead, ID_LEN + INSTANCE_LEN + TIMESTAMP_LEN + MSG_LEN_LEN);
    }
}
