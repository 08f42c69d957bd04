//! Key paths.
//!
//! A key path is the concatenation of its segments' encodings:
//!
//! - root: no bytes
//! - index or enum tag: `(value << 1) | is_enum` as a LEB128 varint, 1 to 7
//!   bytes, so `value` must be below 2^48
//! - string: raw UTF-8 bytes; the empty string is the single byte `0xFF`
//!
//! Varint segments are prefix-free, which is what makes removing a subtree
//! by key prefix safe for index and enum keyed records.

use crate::error::StorageError;
use stepchart_wal::varint::put_varint;

/// Largest value an index or enum segment can carry.
pub const MAX_INDEX: u64 = (1 << 48) - 1;

const EMPTY_STRING: u8 = 0xFF;

/// An encoded key path.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPath {
    bytes: Vec<u8>,
}

impl KeyPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Appends a plain index segment.
    pub fn push_index(&mut self, value: u64) -> Result<(), StorageError> {
        self.push_tagged(value, 0)
    }

    /// Appends an enum tag segment.
    pub fn push_enum(&mut self, value: u64) -> Result<(), StorageError> {
        self.push_tagged(value, 1)
    }

    /// Appends a string segment.
    pub fn push_str(&mut self, value: &str) {
        if value.is_empty() {
            self.bytes.push(EMPTY_STRING);
        } else {
            self.bytes.extend_from_slice(value.as_bytes());
        }
    }

    /// Returns a copy of this path extended by `segment`.
    pub fn join(&self, segment: impl KeySegment) -> Result<Self, StorageError> {
        let mut path = self.clone();
        segment.append_to(&mut path)?;
        Ok(path)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn push_tagged(&mut self, value: u64, tag: u64) -> Result<(), StorageError> {
        if value > MAX_INDEX {
            return Err(StorageError::KeyTooLarge(value));
        }
        put_varint(&mut self.bytes, (value << 1) | tag);
        Ok(())
    }
}

/// A value usable as one segment of a key path.
///
/// Enumerations used as keys implement this with [`KeyPath::push_enum`].
pub trait KeySegment {
    fn append_to(&self, path: &mut KeyPath) -> Result<(), StorageError>;
}

/// The root sentinel: contributes no bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Root;

impl KeySegment for Root {
    fn append_to(&self, _path: &mut KeyPath) -> Result<(), StorageError> {
        Ok(())
    }
}

macro_rules! index_segment {
    ($($ty:ty),*) => {
        $(
            impl KeySegment for $ty {
                fn append_to(&self, path: &mut KeyPath) -> Result<(), StorageError> {
                    path.push_index(*self as u64)
                }
            }
        )*
    };
}

index_segment!(u8, u16, u32, u64, usize);

impl KeySegment for str {
    fn append_to(&self, path: &mut KeyPath) -> Result<(), StorageError> {
        path.push_str(self);
        Ok(())
    }
}

impl KeySegment for String {
    fn append_to(&self, path: &mut KeyPath) -> Result<(), StorageError> {
        path.push_str(self);
        Ok(())
    }
}

impl<T: KeySegment + ?Sized> KeySegment for &T {
    fn append_to(&self, path: &mut KeyPath) -> Result<(), StorageError> {
        (**self).append_to(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy)]
    enum Tag {
        First = 1,
        Big = 200,
    }

    impl KeySegment for Tag {
        fn append_to(&self, path: &mut KeyPath) -> Result<(), StorageError> {
            path.push_enum(*self as u64)
        }
    }

    #[test]
    fn test_root_is_empty() {
        let path = KeyPath::root().join(Root).unwrap();
        assert!(path.is_empty());
    }

    #[test]
    fn test_index_and_enum_layout() {
        let path = KeyPath::root().join(3u32).unwrap();
        assert_eq!(path.as_bytes(), &[0x06]);

        let path = KeyPath::root().join(Tag::First).unwrap();
        assert_eq!(path.as_bytes(), &[0x03]);

        // (200 << 1) | 1 = 401 = 0b1_1001_0001
        let path = KeyPath::root().join(Tag::Big).unwrap();
        assert_eq!(path.as_bytes(), &[0x91, 0x03]);
    }

    #[test]
    fn test_index_limits() {
        let path = KeyPath::root().join(MAX_INDEX).unwrap();
        assert_eq!(path.len(), 7);

        let result = KeyPath::root().join(MAX_INDEX + 1);
        assert!(matches!(result, Err(StorageError::KeyTooLarge(_))));
    }

    #[test]
    fn test_string_segments() {
        let path = KeyPath::root().join("ab").unwrap();
        assert_eq!(path.as_bytes(), b"ab");

        let path = KeyPath::root().join("").unwrap();
        assert_eq!(path.as_bytes(), &[0xFF]);
    }

    #[test]
    fn test_nested_paths_share_prefix() {
        let parent = KeyPath::root().join(Tag::First).unwrap();
        let child = parent.join(7u32).unwrap();
        assert!(child.as_bytes().starts_with(parent.as_bytes()));

        // Sibling indices never prefix each other
        let a = parent.join(1u32).unwrap();
        let b = parent.join(129u32).unwrap();
        assert!(!b.as_bytes().starts_with(a.as_bytes()));
    }
}
