//! # stepchart-runtime
//!
//! Host side of stepchart.
//!
//! This crate provides:
//! - Layered configuration (defaults, YAML file, `STEPCHART_*` environment)
//! - JSON chart definitions loaded into engine documents
//! - A session host running many sessions as tokio tasks, one log file each

pub mod chart;
pub mod config;
pub mod error;
pub mod host;

pub use chart::{load_chart, ChartDef};
pub use config::{Config, EngineConfig, FsyncPolicy, StorageConfig};
pub use error::{ChartError, ConfigError, RuntimeError};
pub use host::{HostStats, SessionHost, SessionOutcome, SessionStatus};
