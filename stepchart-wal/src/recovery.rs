//! Offline log inspection.
//!
//! Walks a log without applying it and reports what it contains:
//! - Data records per checkpoint level
//! - Skip blocks
//! - Where the valid tail ends and how many stale bytes follow it
//! - Partial records at the end (left by a crash mid-write)
//!
//! Nothing here modifies a log: a damaged log is reported, never repaired.

use crate::entry::{Decoded, LogRecord, Operation, RecordKind};
use crate::error::WalError;
use crate::MAX_LEVEL;
use std::collections::BTreeMap;
use std::path::Path;

/// Result of a log scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LogReport {
    /// Data records found, by checkpoint level.
    pub records_by_level: BTreeMap<u8, u64>,
    /// Number of skip blocks.
    pub skip_blocks: u64,
    /// Total operations across all data records.
    pub operations: u64,
    /// Offset where the valid tail ends.
    pub valid_len: u64,
    /// Offset of the final mark, if the tail is terminated by one.
    pub final_mark: Option<u64>,
    /// Bytes after the valid tail (stale data or padding).
    pub stale_bytes: u64,
    /// Offset of a partial or corrupt record, if the scan stopped on one.
    pub damaged_at: Option<u64>,
    /// Description of the damage.
    pub damage: Option<String>,
}

impl LogReport {
    /// Returns the number of data records.
    pub fn records(&self) -> u64 {
        self.records_by_level.values().sum()
    }

    /// Returns whether the log can be opened as-is.
    pub fn is_clean(&self) -> bool {
        self.damaged_at.is_none()
    }

    /// Returns the deepest checkpoint level present.
    pub fn max_level(&self) -> Option<u8> {
        self.records_by_level.keys().next_back().copied()
    }
}

/// Scans log bytes.
///
/// Damage is reported rather than returned as an error, so a damaged log can
/// still be inspected up to the damaged record.
pub fn verify_log(data: &[u8]) -> LogReport {
    let mut report = LogReport::default();
    let mut offset = 0usize;

    loop {
        match LogRecord::decode(&data[offset..], offset as u64) {
            Ok(Decoded::End) => break,
            Ok(Decoded::Final) => {
                report.final_mark = Some(offset as u64);
                break;
            }
            Ok(Decoded::Record { record, len }) => {
                match record.kind {
                    RecordKind::Skip => report.skip_blocks += 1,
                    RecordKind::Data { level } => {
                        match Operation::decode_all(&record.payload, offset as u64) {
                            Ok(ops) => report.operations += ops.len() as u64,
                            Err(e) => {
                                report.damaged_at = Some(offset as u64);
                                report.damage = Some(e.to_string());
                                break;
                            }
                        }
                        *report.records_by_level.entry(level).or_insert(0) += 1;
                    }
                }
                offset += len;
            }
            Err(e) => {
                report.damaged_at = Some(offset as u64);
                report.damage = Some(e.to_string());
                break;
            }
        }
    }

    report.valid_len = offset as u64;
    let consumed = match report.final_mark {
        Some(_) => offset + 1,
        None => offset,
    };
    report.stale_bytes = data.len().saturating_sub(consumed) as u64;
    report
}

/// Scans a log file without modifying it.
pub fn verify_log_file(path: impl AsRef<Path>) -> Result<LogReport, WalError> {
    let data = std::fs::read(path)?;
    Ok(verify_log(&data))
}

/// Returns whether `level` is a valid checkpoint level.
pub fn is_valid_level(level: u8) -> bool {
    level <= MAX_LEVEL
}
