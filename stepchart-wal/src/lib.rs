//! # stepchart-wal
//!
//! Transactional checkpoint log for stepchart.
//!
//! This crate provides:
//! - A byte-level key/value [`Storage`] abstraction with an in-memory implementation
//! - Leveled log records (`mark | size | payload`) terminated by a final mark
//! - [`StreamStorage`]: staged writes flushed by `checkpoint(level)`, replay with
//!   rollback to a checkpoint level, and log compaction (`shrink`)
//! - Offline log verification

pub mod entry;
pub mod error;
pub mod recovery;
pub mod storage;
pub mod stream;
pub mod varint;
pub mod wal;

pub use entry::{Decoded, LogRecord, Operation, RecordKind};
pub use error::WalError;
pub use recovery::{verify_log, verify_log_file, LogReport};
pub use storage::{InMemoryStorage, Storage};
pub use stream::{FileStream, LogStream, MemoryStream};
pub use wal::{FsyncPolicy, LogConfig, LogStats, StreamStorage};

/// Byte that terminates the currently valid tail of a log.
pub const FINAL_MARK: u8 = 4;

/// Mark value of a skip (padding) block.
pub const SKIP_MARK: u64 = 2;

/// Highest checkpoint level a data record can carry.
pub const MAX_LEVEL: u8 = 63;
