//! Storage error types.

use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key segment {0} exceeds the maximum index")]
    KeyTooLarge(u64),

    #[error("malformed {type_name} value: {reason}")]
    MalformedValue {
        type_name: &'static str,
        reason: String,
    },

    #[error("{type_name} value {value} cannot be stored")]
    OutOfRange {
        type_name: &'static str,
        value: String,
    },

    #[error("WAL error: {0}")]
    Wal(#[from] stepchart_wal::WalError),
}

impl StorageError {
    pub(crate) fn malformed(type_name: &'static str, reason: impl Into<String>) -> Self {
        StorageError::MalformedValue {
            type_name,
            reason: reason.into(),
        }
    }

    /// Returns true if the stored bytes themselves are bad.
    pub fn is_corruption(&self) -> bool {
        match self {
            StorageError::MalformedValue { .. } => true,
            StorageError::Wal(e) => e.is_corruption(),
            StorageError::KeyTooLarge(_) | StorageError::OutOfRange { .. } => false,
        }
    }
}
