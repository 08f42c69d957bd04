//! Log record types.
//!
//! Each log record has the following on-disk format:
//!
//! ```text
//! +----------------+----------------+------------------------+
//! | mark (varint)  | size (varint)  | payload (size bytes)   |
//! +----------------+----------------+------------------------+
//! ```
//!
//! - `mark & 1 == 1`: data record, checkpoint level is `mark >> 1`
//! - `mark == 2` (bit pattern `10`): skip block, the payload is padding
//! - a single byte `4` ([`FINAL_MARK`]) ends the valid tail; whatever follows
//!   it is stale or padding
//!
//! A data record payload is the delta of one transaction: a sequence of
//! [`Operation`]s.

use crate::error::WalError;
use crate::varint::{get_varint, put_varint};
use crate::{FINAL_MARK, MAX_LEVEL, SKIP_MARK};
use bytes::{BufMut, Bytes, BytesMut};

/// Maximum record payload size (64 MiB).
pub const MAX_RECORD_SIZE: u64 = 64 * 1024 * 1024;

const OP_SET: u64 = 1;
const OP_REMOVE: u64 = 2;
const OP_REMOVE_ALL: u64 = 3;

/// Kind of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Transaction delta committed by a checkpoint of the given level.
    Data { level: u8 },
    /// Padding.
    Skip,
}

impl RecordKind {
    fn mark(&self) -> u64 {
        match self {
            RecordKind::Data { level } => ((*level as u64) << 1) | 1,
            RecordKind::Skip => SKIP_MARK,
        }
    }

    fn from_mark(mark: u64, offset: u64) -> Result<Self, WalError> {
        if mark & 1 == 1 {
            let level = mark >> 1;
            if level > MAX_LEVEL as u64 {
                return Err(WalError::UnknownMark { offset, mark });
            }
            Ok(RecordKind::Data { level: level as u8 })
        } else if mark == SKIP_MARK {
            Ok(RecordKind::Skip)
        } else {
            Err(WalError::UnknownMark { offset, mark })
        }
    }
}

/// A complete log record (kind + payload).
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub kind: RecordKind,
    pub payload: Bytes,
}

/// Result of decoding at a position in the log.
#[derive(Debug)]
pub enum Decoded {
    /// A complete record and the number of bytes it occupies.
    Record { record: LogRecord, len: usize },
    /// The final mark: the valid tail ends here.
    Final,
    /// The buffer ended exactly at a record boundary.
    End,
}

impl LogRecord {
    /// Creates a data record for the given checkpoint level.
    pub fn data(level: u8, payload: Bytes) -> Result<Self, WalError> {
        if level > MAX_LEVEL {
            return Err(WalError::InvalidLevel(level));
        }
        Ok(Self {
            kind: RecordKind::Data { level },
            payload,
        })
    }

    /// Creates a skip block of `len` zero bytes.
    pub fn skip(len: usize) -> Self {
        Self {
            kind: RecordKind::Skip,
            payload: Bytes::from(vec![0u8; len]),
        }
    }

    /// Encodes the record into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WalError> {
        let size = self.payload.len() as u64;
        if size > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge {
                size,
                max: MAX_RECORD_SIZE,
            });
        }

        put_varint(buf, self.kind.mark());
        put_varint(buf, size);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Decodes the record starting at `buf[0]`; `offset` is its position in the
    /// log and is only used for error reporting.
    pub fn decode(buf: &[u8], offset: u64) -> Result<Decoded, WalError> {
        if buf.is_empty() {
            return Ok(Decoded::End);
        }
        if buf[0] == FINAL_MARK {
            return Ok(Decoded::Final);
        }

        let (mark, mark_len) = get_varint(buf).ok_or(WalError::TruncatedRecord { offset })?;
        let kind = RecordKind::from_mark(mark, offset)?;

        let (size, size_len) =
            get_varint(&buf[mark_len..]).ok_or(WalError::TruncatedRecord { offset })?;
        if size > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge {
                size,
                max: MAX_RECORD_SIZE,
            });
        }

        let header_len = mark_len + size_len;
        let total_len = header_len + size as usize;
        if buf.len() < total_len {
            return Err(WalError::TruncatedRecord { offset });
        }

        Ok(Decoded::Record {
            record: LogRecord {
                kind,
                payload: Bytes::copy_from_slice(&buf[header_len..total_len]),
            },
            len: total_len,
        })
    }

    /// Returns the checkpoint level of a data record.
    pub fn level(&self) -> Option<u8> {
        match self.kind {
            RecordKind::Data { level } => Some(level),
            RecordKind::Skip => None,
        }
    }
}

/// A single mutation of the byte store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Set { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
    RemoveAll { prefix: Vec<u8> },
}

impl Operation {
    /// Appends the encoded operation to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Operation::Set { key, value } => {
                put_varint(buf, OP_SET);
                put_bytes(buf, key);
                put_bytes(buf, value);
            }
            Operation::Remove { key } => {
                put_varint(buf, OP_REMOVE);
                put_bytes(buf, key);
            }
            Operation::RemoveAll { prefix } => {
                put_varint(buf, OP_REMOVE_ALL);
                put_bytes(buf, prefix);
            }
        }
    }

    /// Encodes a whole transaction into a record payload.
    pub fn encode_all(ops: &[Operation]) -> Bytes {
        let mut buf = BytesMut::new();
        for op in ops {
            op.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Decodes every operation in a record payload.
    pub fn decode_all(payload: &[u8], offset: u64) -> Result<Vec<Operation>, WalError> {
        let mut ops = Vec::new();
        let mut pos = 0usize;

        while pos < payload.len() {
            let (tag, n) = get_varint(&payload[pos..]).ok_or(WalError::MalformedVarint {
                offset: offset + pos as u64,
            })?;
            pos += n;

            let key = take_bytes(payload, &mut pos, offset)?;
            let op = match tag {
                OP_SET => {
                    let value = take_bytes(payload, &mut pos, offset)?;
                    Operation::Set { key, value }
                }
                OP_REMOVE => Operation::Remove { key },
                OP_REMOVE_ALL => Operation::RemoveAll { prefix: key },
                other => {
                    return Err(WalError::MalformedOperation {
                        offset: offset + pos as u64,
                        reason: format!("unknown operation tag {}", other),
                    })
                }
            };
            ops.push(op);
        }

        Ok(ops)
    }
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

fn take_bytes(payload: &[u8], pos: &mut usize, offset: u64) -> Result<Vec<u8>, WalError> {
    let (len, n) = get_varint(&payload[*pos..]).ok_or(WalError::MalformedVarint {
        offset: offset + *pos as u64,
    })?;
    *pos += n;

    let end = pos
        .checked_add(len as usize)
        .filter(|&end| end <= payload.len())
        .ok_or_else(|| WalError::MalformedOperation {
            offset: offset + *pos as u64,
            reason: format!("length {} exceeds payload", len),
        })?;
    let bytes = payload[*pos..end].to_vec();
    *pos = end;
    Ok(bytes)
}
