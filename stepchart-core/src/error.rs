//! Engine error types and error classification.

use crate::event::SessionId;
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Error type returned by actions, conditions and collaborators.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Fatal outcomes and failures of a statechart run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session halted")]
    Halted,

    #[error("session destroyed")]
    Destroyed,

    #[error("session suspended")]
    Suspended,

    #[error("live-lock detected: internal queue did not shrink over {window} microsteps")]
    LiveLock { window: usize },

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("storage error: {0}")]
    Storage(#[from] stepchart_storage::StorageError),

    #[error("log error: {0}")]
    Wal(#[from] stepchart_wal::WalError),

    #[error("invalid document: {reason}")]
    InvalidDocument { reason: String },

    #[error("platform error: {0}")]
    Platform(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub(crate) fn invalid_document(reason: impl Into<String>) -> Self {
        EngineError::InvalidDocument {
            reason: reason.into(),
        }
    }

    /// Returns whether the session can be resumed from its log after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Suspended => true,
            EngineError::Wal(e) => e.is_retryable(),
            EngineError::Storage(stepchart_storage::StorageError::Wal(e)) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns whether the stored state of the session is unusable.
    pub fn is_corruption(&self) -> bool {
        match self {
            EngineError::Persistence(_) => true,
            EngineError::Storage(e) => e.is_corruption(),
            EngineError::Wal(e) => e.is_corruption(),
            _ => false,
        }
    }
}

/// Mismatch between a session log and the run that opened it. Always fatal.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("log format version {found}, expected {expected}")]
    VersionMismatch { expected: i64, found: i64 },

    #[error("log belongs to session {found}, expected {expected}")]
    SessionMismatch { expected: String, found: String },

    #[error("log was written for document checksum {found:08x}, expected {expected:08x}")]
    ChecksumMismatch { expected: u32, found: u32 },

    #[error("step {depth}/{index} is {found}, expected {expected}")]
    StepMismatch {
        depth: u32,
        index: u32,
        expected: String,
        found: String,
    },

    #[error("missing or invalid field: {0}")]
    Corrupt(String),
}

/// Kind of a recovered error, which decides the name of the raised event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Execution,
    Communication,
    Platform,
}

impl ErrorKind {
    /// Name of the internal event raised for this kind.
    pub fn event_name(&self) -> &'static str {
        match self {
            ErrorKind::Execution => "error.execution",
            ErrorKind::Communication => "error.communication",
            ErrorKind::Platform => "error.platform",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// Marker for an engine invariant violation in a specific session.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PlatformFault {
    pub session: SessionId,
    pub message: String,
}

impl PlatformFault {
    pub fn new(session: SessionId, message: impl Into<String>) -> Self {
        Self {
            session,
            message: message.into(),
        }
    }
}

/// Marker for a failure at the event dispatch or invoke boundary.
#[derive(Debug, Error)]
#[error("communication failure{}: {source}", .send_id.as_deref().map(|id| format!(" for '{}'", id)).unwrap_or_default())]
pub struct CommunicationFault {
    pub session: SessionId,
    pub send_id: Option<String>,
    #[source]
    pub source: BoxError,
}

impl CommunicationFault {
    pub fn new(session: SessionId, send_id: Option<String>, source: BoxError) -> Self {
        Self {
            session,
            send_id,
            source,
        }
    }
}

/// Classifies an error raised while running executable content.
///
/// Walks the `source()` chain for a fault marker carrying `session`; anything
/// else is an execution error. Markers from other sessions are ignored.
pub fn classify(error: &(dyn StdError + 'static), session: &SessionId) -> (ErrorKind, Option<String>) {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(fault) = err.downcast_ref::<PlatformFault>() {
            if &fault.session == session {
                return (ErrorKind::Platform, None);
            }
        }
        if let Some(fault) = err.downcast_ref::<CommunicationFault>() {
            if &fault.session == session {
                return (ErrorKind::Communication, fault.send_id.clone());
            }
        }
        current = err.source();
    }
    (ErrorKind::Execution, None)
}
