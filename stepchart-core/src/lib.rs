//! # stepchart-core
//!
//! Resumable statechart engine for stepchart.
//!
//! This crate provides:
//! - Statechart documents with dense document ids ([`document`])
//! - The W3C macrostep/microstep interpreter ([`Interpreter`])
//! - Executable content, conditions and the session data model
//! - A step stack recorded in the session log, so a reopened session
//!   continues from its last checkpoint without re-running completed work
//! - Invoke lifecycle and error-to-event classification
//! - Cancellation (stop, destroy, suspend) and live-lock detection

pub mod action;
pub mod cancel;
pub mod capture;
pub mod collections;
mod context;
pub mod datamodel;
pub mod document;
pub mod engine;
pub mod error;
pub mod event;
pub mod invoke;
pub mod layout;
pub mod livelock;
pub mod observer;
pub mod options;
pub mod queue;

pub use action::{Action, ActionContext, Condition, ValueExpr};
pub use cancel::{CancelReason, CancellationContext};
pub use capture::{Step, StepResult};
pub use datamodel::DataModel;
pub use document::{DocId, Document, DocumentBuilder};
pub use engine::{CheckpointLevel, EngineState, Interpreter, InterpreterBuilder, SessionLog};
pub use error::{BoxError, EngineError, ErrorKind, PersistenceError};
pub use event::{Event, EventType, InvokeId, SessionId};
pub use invoke::{EventDispatcher, InvokeController, InvokeRequest, OutgoingEvent};
pub use observer::{EngineObserver, NoopObserver};
pub use options::{InterpreterOptions, UnhandledErrorPolicy};
pub use queue::{EventSender, ExternalQueue, SendError};
