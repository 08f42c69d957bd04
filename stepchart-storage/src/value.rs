//! Value encodings.
//!
//! | type | layout |
//! |---|---|
//! | `bool` | 1 byte, `0` or `1` |
//! | integers | sign-minimal little-endian two's complement, 1 to 8 bytes; `u64` above `i64::MAX` is rejected |
//! | `f64` | 8 bytes little-endian |
//! | `DateTime<Utc>` | microseconds since the epoch as 8 bytes little-endian |
//! | `DateTime<FixedOffset>` | as above, then the offset in minutes as 2 bytes |
//! | `String`, [`Uri`] | varint length, then UTF-8 bytes |
//! | [`DocIdList`] | concatenated varints |

use crate::error::StorageError;
use bytes::BufMut;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use stepchart_wal::varint::{get_varint, put_varint};

/// A type with an exact-length binary encoding in a bucket.
pub trait BucketValue: Sized {
    /// Appends the encoding of `self` to `buf`.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), StorageError>;

    /// Decodes a value from exactly `bytes`.
    fn decode(bytes: &[u8]) -> Result<Self, StorageError>;

    fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

impl BucketValue for bool {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        buf.put_u8(*self as u8);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        match bytes {
            [0] => Ok(false),
            [1] => Ok(true),
            _ => Err(StorageError::malformed("bool", format!("{:?}", bytes))),
        }
    }
}

fn put_signed(buf: &mut Vec<u8>, value: i64) {
    let bytes = value.to_le_bytes();
    let mut len = 8;
    // Drop high bytes that only repeat the sign of the byte below them.
    while len > 1 {
        let top = bytes[len - 1];
        let next_sign = bytes[len - 2] & 0x80;
        if (top == 0x00 && next_sign == 0) || (top == 0xFF && next_sign != 0) {
            len -= 1;
        } else {
            break;
        }
    }
    buf.put_slice(&bytes[..len]);
}

fn get_signed(bytes: &[u8], type_name: &'static str) -> Result<i64, StorageError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(StorageError::malformed(
            type_name,
            format!("{} bytes", bytes.len()),
        ));
    }
    let fill = if bytes[bytes.len() - 1] & 0x80 != 0 {
        0xFF
    } else {
        0x00
    };
    let mut full = [fill; 8];
    full[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(full))
}

impl BucketValue for i64 {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        put_signed(buf, *self);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        get_signed(bytes, "i64")
    }
}

macro_rules! narrow_integer {
    ($($ty:ty),*) => {
        $(
            impl BucketValue for $ty {
                fn encode(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
                    let value = i64::try_from(*self).map_err(|_| StorageError::OutOfRange {
                        type_name: stringify!($ty),
                        value: self.to_string(),
                    })?;
                    put_signed(buf, value);
                    Ok(())
                }

                fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
                    let value = get_signed(bytes, stringify!($ty))?;
                    <$ty>::try_from(value).map_err(|_| {
                        StorageError::malformed(stringify!($ty), format!("{} out of range", value))
                    })
                }
            }
        )*
    };
}

narrow_integer!(i32, u32, u64);

impl BucketValue for f64 {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        buf.put_f64_le(*self);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| StorageError::malformed("f64", format!("{} bytes", bytes.len())))?;
        Ok(f64::from_le_bytes(raw))
    }
}

impl BucketValue for String {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        put_varint(buf, self.len() as u64);
        buf.put_slice(self.as_bytes());
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (len, n) =
            get_varint(bytes).ok_or_else(|| StorageError::malformed("string", "bad length"))?;
        let body = &bytes[n..];
        if body.len() as u64 != len {
            return Err(StorageError::malformed(
                "string",
                format!("length {} but {} bytes", len, body.len()),
            ));
        }
        String::from_utf8(body.to_vec()).map_err(|e| StorageError::malformed("string", e.to_string()))
    }
}

/// A URI, stored like a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri(pub String);

impl BucketValue for Uri {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        self.0.encode(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        String::decode(bytes).map(Uri)
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn micros_from(bytes: &[u8], type_name: &'static str) -> Result<DateTime<Utc>, StorageError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::malformed(type_name, format!("{} bytes", bytes.len())))?;
    let micros = i64::from_le_bytes(raw);
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| StorageError::malformed(type_name, format!("{} out of range", micros)))
}

impl BucketValue for DateTime<Utc> {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        buf.put_i64_le(self.timestamp_micros());
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        micros_from(bytes, "datetime")
    }
}

impl BucketValue for DateTime<FixedOffset> {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        buf.put_i64_le(self.timestamp_micros());
        buf.put_i16_le((self.offset().local_minus_utc() / 60) as i16);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() != 10 {
            return Err(StorageError::malformed(
                "datetime with offset",
                format!("{} bytes", bytes.len()),
            ));
        }
        let utc = micros_from(&bytes[..8], "datetime with offset")?;
        let minutes = i16::from_le_bytes([bytes[8], bytes[9]]) as i32;
        let offset = FixedOffset::east_opt(minutes * 60).ok_or_else(|| {
            StorageError::malformed("datetime with offset", format!("offset {}", minutes))
        })?;
        Ok(offset.from_utc_datetime(&utc.naive_utc()))
    }
}

/// An ordered list of document ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocIdList(pub Vec<u32>);

impl BucketValue for DocIdList {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        for id in &self.0 {
            put_varint(buf, *id as u64);
        }
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let mut ids = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (id, n) = get_varint(&bytes[pos..])
                .ok_or_else(|| StorageError::malformed("id list", "bad varint"))?;
            let id = u32::try_from(id)
                .map_err(|_| StorageError::malformed("id list", format!("{} out of range", id)))?;
            ids.push(id);
            pos += n;
        }
        Ok(DocIdList(ids))
    }
}

impl From<Vec<u32>> for DocIdList {
    fn from(ids: Vec<u32>) -> Self {
        DocIdList(ids)
    }
}
