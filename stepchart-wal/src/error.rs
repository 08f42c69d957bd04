//! Log error types.

use thiserror::Error;

/// Errors that can occur while reading or writing the checkpoint log.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated record at offset {offset}")]
    TruncatedRecord { offset: u64 },

    #[error("unknown record mark {mark:#x} at offset {offset}")]
    UnknownMark { offset: u64, mark: u64 },

    #[error("malformed varint at offset {offset}")]
    MalformedVarint { offset: u64 },

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: u64, max: u64 },

    #[error("malformed operation at offset {offset}: {reason}")]
    MalformedOperation { offset: u64, reason: String },

    #[error("checkpoint level {0} out of range")]
    InvalidLevel(u8),

    #[error("invalid log state: {0}")]
    InvalidState(String),
}

impl WalError {
    /// Returns whether this error is retryable.
    ///
    /// Only raw I/O failures are; anything that says the log content itself is
    /// wrong is permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalError::Io(_))
    }

    /// Returns whether this error means the persisted log cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            WalError::TruncatedRecord { .. }
                | WalError::UnknownMark { .. }
                | WalError::MalformedVarint { .. }
                | WalError::RecordTooLarge { .. }
                | WalError::MalformedOperation { .. }
        )
    }
}
