//! Runtime error types.

use stepchart_core::{EngineError, SessionId};
use thiserror::Error;

pub use crate::config::ConfigError;

/// Session host errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("WAL error: {0}")]
    Wal(#[from] stepchart_wal::WalError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("chart error: {0}")]
    Chart(#[from] ChartError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session already exists: {0}")]
    SessionExists(SessionId),

    #[error("session already running: {0}")]
    SessionRunning(SessionId),

    #[error("session {0} is not accepting events")]
    SessionClosed(SessionId),

    #[error("event queue of session {0} is full")]
    QueueFull(SessionId),

    #[error("session task failed: {0}")]
    Join(String),

    #[error("host shutting down")]
    ShuttingDown,
}

impl RuntimeError {
    /// Returns whether retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Io(_) | RuntimeError::QueueFull(_) => true,
            RuntimeError::Wal(e) => e.is_retryable(),
            RuntimeError::Engine(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

/// Errors in a JSON chart.
#[derive(Debug, Error)]
pub enum ChartError {
    #[error("invalid chart JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read chart file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid chart: {0}")]
    Invalid(String),

    #[error("invalid document: {0}")]
    Document(#[source] EngineError),
}
