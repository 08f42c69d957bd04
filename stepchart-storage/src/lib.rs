//! # stepchart-storage
//!
//! Persisted state addressing for stepchart.
//!
//! This crate provides:
//! - Hierarchical key paths built from index, enum and string segments
//! - Exact-length binary encodings for the value types the engine persists
//! - [`Bucket`]: a view of a byte [`Storage`](stepchart_wal::Storage) rooted
//!   at a key path, with nested buckets sharing their parent's prefix

pub mod bucket;
pub mod error;
pub mod key;
pub mod value;

pub use bucket::{Bucket, SharedStorage};
pub use error::StorageError;
pub use key::{KeyPath, KeySegment, Root, MAX_INDEX};
pub use value::{BucketValue, DocIdList, Uri};
