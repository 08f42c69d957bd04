//! The interpreter: macrostep/microstep loop over a checkpoint log.
//!
//! An [`Interpreter`] runs one session of a [`Document`]. Every change it
//! makes to its execution context is staged in the session log and
//! committed by checkpoints:
//!
//! - `Transition` after every loop iteration (one microstep),
//! - `Event` after an external event was taken,
//! - `StableState` before waiting for an external event; the log is also
//!   shrunk there when it has grown past its threshold.
//!
//! The loop itself is a program of [`Step`]s recorded in the log, so a
//! session reopened from its log continues where the last checkpoint left
//! it without evaluating completed guards or actions again.
//!
//! ```
//! use std::sync::Arc;
//! use stepchart_core::document::{DocumentBuilder, StateSpec, TransitionSpec};
//! use stepchart_core::{queue, CancellationContext, Event, Interpreter, SessionId};
//! use stepchart_wal::{LogConfig, MemoryStream};
//!
//! let doc = DocumentBuilder::new("door")
//!     .state(StateSpec::state("closed").transition(TransitionSpec::on("open").target("opened")))
//!     .state(StateSpec::final_state("opened"))
//!     .build()
//!     .unwrap();
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! runtime.block_on(async {
//!     let interpreter = Interpreter::builder(Arc::new(doc), SessionId::new())
//!         .open(MemoryStream::new(), LogConfig::default())
//!         .unwrap();
//!     let (tx, rx) = queue::channel(None);
//!     tx.send(Event::external("open")).await.unwrap();
//!     let done = interpreter.run(rx, CancellationContext::new()).await.unwrap();
//!     assert_eq!(done, None);
//! });
//! ```

mod algorithm;

use crate::cancel::{CancelReason, CancellationContext};
use crate::capture::{Capture, Step, StepResult};
use crate::context::ExecutionContext;
use crate::datamodel::DataModel;
use crate::document::Document;
use crate::error::{CommunicationFault, EngineError, PersistenceError};
use crate::event::{Event, InvokeId, SessionId};
use crate::invoke::{EventDispatcher, InvokeController, InvokeRequest, NoDispatch, NoInvokes};
use crate::layout::{corrupt, Key, FORMAT_VERSION};
use crate::livelock::LiveLockDetector;
use crate::observer::{EngineObserver, NoopObserver};
use crate::options::{InterpreterOptions, UnhandledErrorPolicy};
use crate::queue::ExternalQueue;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use stepchart_storage::{Bucket, SharedStorage};
use stepchart_wal::{LogConfig, LogStats, LogStream, StreamStorage};

/// Log of one session.
pub type SessionLog = Arc<Mutex<StreamStorage<Box<dyn LogStream>>>>;

/// Checkpoint levels. Lower levels are safer rollback targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointLevel {
    /// About to wait for an external event.
    StableState = 0,
    /// An external event was taken.
    Event = 1,
    /// A loop iteration finished.
    Transition = 2,
}

/// Lifecycle of an interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Initializing,
    Accepted,
    Started,
    Waiting,
    Processing,
    Exited,
    Halted,
    Suspended,
    Destroying,
    Destroyed,
}

impl EngineState {
    pub(crate) fn code(self) -> i64 {
        match self {
            EngineState::Initializing => 0,
            EngineState::Accepted => 1,
            EngineState::Started => 2,
            EngineState::Waiting => 3,
            EngineState::Processing => 4,
            EngineState::Exited => 5,
            EngineState::Halted => 6,
            EngineState::Suspended => 7,
            EngineState::Destroying => 8,
            EngineState::Destroyed => 9,
        }
    }

    pub(crate) fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => EngineState::Initializing,
            1 => EngineState::Accepted,
            2 => EngineState::Started,
            3 => EngineState::Waiting,
            4 => EngineState::Processing,
            5 => EngineState::Exited,
            6 => EngineState::Halted,
            7 => EngineState::Suspended,
            8 => EngineState::Destroying,
            9 => EngineState::Destroyed,
            _ => return None,
        })
    }

    /// Returns whether a session in this state can never run again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EngineState::Exited | EngineState::Halted | EngineState::Destroyed
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Initializing => "initializing",
            EngineState::Accepted => "accepted",
            EngineState::Started => "started",
            EngineState::Waiting => "waiting",
            EngineState::Processing => "processing",
            EngineState::Exited => "exited",
            EngineState::Halted => "halted",
            EngineState::Suspended => "suspended",
            EngineState::Destroying => "destroying",
            EngineState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Why the main loop stopped before the chart finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled(CancelReason),
    QueueClosed,
    LiveLock,
    UnhandledError(UnhandledErrorPolicy),
}

/// Builds an [`Interpreter`].
pub struct InterpreterBuilder {
    document: Arc<Document>,
    session: SessionId,
    options: InterpreterOptions,
    controller: Arc<dyn InvokeController>,
    dispatcher: Arc<dyn EventDispatcher>,
    observer: Arc<dyn EngineObserver>,
}

impl InterpreterBuilder {
    pub fn options(mut self, options: InterpreterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn controller(mut self, controller: Arc<dyn InvokeController>) -> Self {
        self.controller = controller;
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Opens the session log and either starts a new session in it or
    /// restores the session it holds.
    ///
    /// Fails with a [`PersistenceError`] if the log belongs to another
    /// session, another document or another format version.
    pub fn open<S: LogStream + 'static>(
        self,
        stream: S,
        config: LogConfig,
    ) -> Result<Interpreter, EngineError> {
        let stream: Box<dyn LogStream> = Box::new(stream);
        let log: SessionLog = Arc::new(Mutex::new(StreamStorage::open(stream, config)?));
        let shared: SharedStorage = log.clone();
        let root = Bucket::new(shared);
        let capture = Capture::new(root.nested(Key::Capture)?);
        let livelock = LiveLockDetector::new(self.options.livelock_window);

        let resumed = root.try_get::<i64>(Key::Version)?.is_some();
        let (ctx, state) = if resumed {
            let state = check_header(&root, &self.document, &self.session)?;
            let ctx = ExecutionContext::restore(root.clone(), &self.document, self.options.case_sensitive)?;
            (ctx, state)
        } else {
            (
                ExecutionContext::fresh(root.clone(), self.options.case_sensitive),
                EngineState::Initializing,
            )
        };

        let mut interpreter = Interpreter {
            document: self.document,
            session: self.session,
            options: self.options,
            controller: self.controller,
            dispatcher: self.dispatcher,
            observer: self.observer,
            log,
            root,
            ctx,
            capture,
            state,
            resumed,
            cancel: CancellationContext::new(),
            livelock,
        };

        if resumed {
            tracing::info!(
                session = %interpreter.session,
                "Restored session '{}' ({}, {} active states)",
                interpreter.document.name(),
                interpreter.state,
                interpreter.ctx.configuration().len()
            );
        } else {
            interpreter.write_header()?;
            tracing::info!(
                session = %interpreter.session,
                "Created session for '{}'",
                interpreter.document.name()
            );
        }
        Ok(interpreter)
    }
}

fn check_header(
    root: &Bucket,
    document: &Document,
    session: &SessionId,
) -> Result<EngineState, EngineError> {
    let version: i64 = root.get_or(Key::Version, 0i64)?;
    if version != FORMAT_VERSION {
        return Err(PersistenceError::VersionMismatch {
            expected: FORMAT_VERSION,
            found: version,
        }
        .into());
    }

    let stored: String = root
        .try_get(Key::SessionId)?
        .ok_or_else(|| corrupt("session id"))?;
    if stored != session.as_str() {
        return Err(PersistenceError::SessionMismatch {
            expected: session.to_string(),
            found: stored,
        }
        .into());
    }

    let checksum: u32 = root
        .try_get(Key::DocumentChecksum)?
        .ok_or_else(|| corrupt("document checksum"))?;
    if checksum != document.checksum() {
        return Err(PersistenceError::ChecksumMismatch {
            expected: document.checksum(),
            found: checksum,
        }
        .into());
    }

    let status: i64 = root.try_get(Key::Status)?.ok_or_else(|| corrupt("status"))?;
    EngineState::from_code(status).ok_or_else(|| corrupt(format!("status {}", status)))
}

/// A running statechart session.
pub struct Interpreter {
    document: Arc<Document>,
    session: SessionId,
    options: InterpreterOptions,
    controller: Arc<dyn InvokeController>,
    dispatcher: Arc<dyn EventDispatcher>,
    observer: Arc<dyn EngineObserver>,
    log: SessionLog,
    root: Bucket,
    ctx: ExecutionContext,
    capture: Capture,
    state: EngineState,
    resumed: bool,
    cancel: CancellationContext,
    livelock: LiveLockDetector,
}

impl Interpreter {
    /// Starts building an interpreter for `session` of `document`. By
    /// default invokes fail to start, external sends fail and nothing
    /// observes the run.
    pub fn builder(document: Arc<Document>, session: SessionId) -> InterpreterBuilder {
        InterpreterBuilder {
            document,
            session,
            options: InterpreterOptions::default(),
            controller: Arc::new(NoInvokes),
            dispatcher: Arc::new(NoDispatch),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Returns whether the session was restored from an existing log.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Ids of the active states, in document order.
    pub fn configuration(&self) -> Vec<String> {
        self.ctx
            .configuration()
            .in_document_order()
            .into_iter()
            .map(|s| self.document.node(s).id().to_string())
            .collect()
    }

    /// Pending internal events, front first.
    pub fn internal_queue(&self) -> Vec<Event> {
        self.ctx.internal_queue().iter().cloned().collect()
    }

    pub fn active_invokes(&self) -> Vec<InvokeId> {
        self.ctx.invokes().iter().cloned().collect()
    }

    pub fn data(&self) -> &DataModel {
        self.ctx.data()
    }

    pub fn log_stats(&self) -> LogStats {
        self.log.lock().stats()
    }

    /// Runs the session until the chart finishes or the run is cut short.
    ///
    /// Returns the done data of the top-level final state, if it has any.
    /// A stop ends with [`EngineError::Halted`], a destroy with
    /// [`EngineError::Destroyed`] and a suspend, or the last sender of
    /// `queue` going away, with [`EngineError::Suspended`]; a suspended
    /// session can be reopened from its log.
    pub async fn run(
        mut self,
        mut queue: ExternalQueue,
        cancel: CancellationContext,
    ) -> Result<Option<Value>, EngineError> {
        self.cancel = cancel;
        match self.state {
            EngineState::Exited => return self.stored_done_data(),
            EngineState::Halted => return Err(EngineError::Halted),
            EngineState::Destroyed => return Err(EngineError::Destroyed),
            _ => {}
        }

        self.set_state(EngineState::Started)?;
        if self.resumed {
            self.restart_invokes()?;
        }

        let outcome = match self.execute(&mut queue).await {
            Ok(None) => self.stored_done_data(),
            Ok(Some(interrupt)) => self.finish_interrupted(interrupt),
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(_) => tracing::info!(session = %self.session, "Session exited"),
            Err(e) if e.is_recoverable() => {
                tracing::info!(session = %self.session, "Session ended: {}", e)
            }
            Err(EngineError::Halted | EngineError::Destroyed) => {
                tracing::info!(session = %self.session, "Session ended: {}", self.state)
            }
            Err(e) => tracing::error!(session = %self.session, "Session failed: {}", e),
        }
        outcome
    }

    /// The step program: initialize, loop, exit.
    async fn execute(&mut self, queue: &mut ExternalQueue) -> Result<Option<Interrupt>, EngineError> {
        if self.capture.enter(Step::Initialize)?.is_none() {
            self.initialize()?;
            self.capture.exit(Step::Initialize, StepResult::None)?;
            self.checkpoint(CheckpointLevel::Transition)?;
        }

        if self.capture.enter(Step::MainLoop)?.is_none() {
            if self.resumed {
                tracing::debug!(
                    session = %self.session,
                    "Resuming main loop at iteration {}",
                    self.capture.iteration()?
                );
            }
            while self.ctx.is_running() {
                if let Some(interrupt) = self.iteration(queue).await? {
                    return Ok(Some(interrupt));
                }
            }
            self.capture.exit(Step::MainLoop, StepResult::None)?;
        }

        if self.capture.enter(Step::ExitInterpreter)?.is_none() {
            let done = self.exit_interpreter()?;
            if let Some(data) = &done {
                self.root.add(Key::DoneData, &serde_json::to_string(data)?)?;
            }
            self.capture.exit(Step::ExitInterpreter, StepResult::None)?;
        }

        self.set_state(EngineState::Exited)?;
        self.checkpoint(CheckpointLevel::StableState)?;
        Ok(None)
    }

    /// One iteration of the main loop: at most one microstep.
    async fn iteration(&mut self, queue: &mut ExternalQueue) -> Result<Option<Interrupt>, EngineError> {
        let queue_before = self.ctx.internal_queue().len() as i64;

        let mut transitions = self
            .step(Step::SelectEventless, |this| {
                Ok(StepResult::Transitions(this.select_eventless_transitions()?))
            })?
            .into_transitions()?;

        if transitions.is_empty() {
            let picked = self
                .step(Step::PickInternal, |this| {
                    let Some(event) = this.ctx.dequeue_internal()? else {
                        return Ok(StepResult::Bool(false));
                    };
                    this.observer.on_event(&this.session, &event);
                    this.ctx.set_current_event(event)?;
                    Ok(StepResult::Bool(true))
                })?
                .into_bool()?;

            if !picked {
                let raised = self
                    .step(Step::StartInvokes, |this| {
                        this.start_invokes()?;
                        Ok(StepResult::Bool(!this.ctx.internal_queue().is_empty()))
                    })?
                    .into_bool()?;
                if raised {
                    return self.end_iteration().map(|_| None);
                }

                self.livelock.reset();
                // A replayed wait already holds its event.
                if !self.capture.is_completed(Step::WaitExternal)? {
                    self.set_state(EngineState::Waiting)?;
                    self.checkpoint(CheckpointLevel::StableState)?;
                    self.shrink_if_needed()?;
                }

                if self.capture.enter(Step::WaitExternal)?.is_none() {
                    match self.wait_external(queue).await {
                        Ok(event) => {
                            self.observer.on_event(&self.session, &event);
                            self.ctx.set_current_event(event)?;
                            self.capture.exit(Step::WaitExternal, StepResult::Bool(true))?;
                        }
                        Err(interrupt) => return Ok(Some(interrupt)),
                    }
                }
                self.set_state(EngineState::Processing)?;
                self.checkpoint(CheckpointLevel::Event)?;

                self.step(Step::ProcessExternal, |this| {
                    this.process_external()?;
                    Ok(StepResult::None)
                })?;
            }

            transitions = self
                .step(Step::SelectForEvent, |this| {
                    let event = this
                        .ctx
                        .current_event()
                        .cloned()
                        .ok_or_else(|| corrupt("current event"))?;
                    Ok(StepResult::Transitions(this.select_transitions(&event)?))
                })?
                .into_transitions()?;

            if transitions.is_empty() {
                if let Some(interrupt) = self.unhandled_error() {
                    return Ok(Some(interrupt));
                }
            }
        }

        if !transitions.is_empty() {
            self.step(Step::Microstep, |this| {
                this.microstep(&transitions)?;
                Ok(StepResult::None)
            })?;

            let delta = self.ctx.internal_queue().len() as i64 - queue_before;
            if self.livelock.sample(delta) {
                return Ok(Some(Interrupt::LiveLock));
            }
        }

        self.end_iteration()?;
        Ok(None)
    }

    fn end_iteration(&mut self) -> Result<(), EngineError> {
        let iteration = self.capture.exit_iteration()?;
        self.checkpoint(CheckpointLevel::Transition)?;
        tracing::trace!(session = %self.session, "Finished iteration {}", iteration);
        Ok(())
    }

    /// Runs a synchronous step, or replays its stored result.
    fn step<F>(&mut self, step: Step, body: F) -> Result<StepResult, EngineError>
    where
        F: FnOnce(&mut Self) -> Result<StepResult, EngineError>,
    {
        if let Some(result) = self.capture.enter(step)? {
            return Ok(result);
        }
        let result = body(self)?;
        self.capture.exit(step, result.clone())?;
        Ok(result)
    }

    /// Waits for the next external event addressed to this session.
    ///
    /// Events from invokes that are not active are dropped here.
    async fn wait_external(&self, queue: &mut ExternalQueue) -> Result<Event, Interrupt> {
        let mut cancel = self.cancel.clone();
        loop {
            if let Some(reason) = self.cancel.reason() {
                return Err(Interrupt::Cancelled(reason));
            }
            let received = tokio::select! {
                biased;
                reason = cancel.cancelled() => return Err(Interrupt::Cancelled(reason)),
                event = queue.recv() => event,
            };
            let Some(event) = received else {
                return Err(Interrupt::QueueClosed);
            };
            if let Some(invoke_id) = &event.invoke_id {
                if !self.ctx.invokes().contains(invoke_id) {
                    tracing::warn!(
                        session = %self.session,
                        "Dropped '{}' from inactive invoke {}",
                        event.name,
                        invoke_id
                    );
                    continue;
                }
            }
            return Ok(event);
        }
    }

    fn unhandled_error(&self) -> Option<Interrupt> {
        let event = self.ctx.current_event()?;
        if !event.name.starts_with("error.") {
            return None;
        }
        match self.options.unhandled_errors {
            UnhandledErrorPolicy::Ignore => {
                tracing::debug!(session = %self.session, "Ignoring unhandled '{}'", event.name);
                None
            }
            policy => {
                tracing::warn!(
                    session = %self.session,
                    "Unhandled '{}', policy {:?}",
                    event.name,
                    policy
                );
                Some(Interrupt::UnhandledError(policy))
            }
        }
    }

    fn finish_interrupted(&mut self, interrupt: Interrupt) -> Result<Option<Value>, EngineError> {
        match interrupt {
            Interrupt::Cancelled(CancelReason::Stop) => {
                for id in self.active_invokes() {
                    self.cancel_invoke(&id)?;
                }
                self.set_state(EngineState::Halted)?;
                self.checkpoint(CheckpointLevel::StableState)?;
                Err(EngineError::Halted)
            }
            Interrupt::Cancelled(CancelReason::Destroy)
            | Interrupt::UnhandledError(UnhandledErrorPolicy::Destroy) => {
                self.destroy()?;
                Err(EngineError::Destroyed)
            }
            Interrupt::Cancelled(CancelReason::Suspend) | Interrupt::QueueClosed => {
                self.suspend();
                Err(EngineError::Suspended)
            }
            Interrupt::LiveLock => {
                let window = self.livelock.window();
                tracing::error!(
                    session = %self.session,
                    "Live-lock: internal queue did not drain over {} microsteps",
                    window
                );
                self.destroy()?;
                Err(EngineError::LiveLock { window })
            }
            Interrupt::UnhandledError(_) => {
                self.exit_interpreter()?;
                self.ctx.set_running(false)?;
                self.set_state(EngineState::Halted)?;
                self.checkpoint(CheckpointLevel::StableState)?;
                Err(EngineError::Halted)
            }
        }
    }

    /// Exit sequence followed by the destroyed state.
    fn destroy(&mut self) -> Result<(), EngineError> {
        self.set_state(EngineState::Destroying)?;
        self.exit_interpreter()?;
        self.ctx.set_running(false)?;
        self.set_state(EngineState::Destroyed)?;
        self.checkpoint(CheckpointLevel::StableState)
    }

    /// Cancels running services and leaves the log at its last checkpoint.
    fn suspend(&mut self) {
        for id in self.ctx.invokes().iter() {
            if let Err(e) = self.controller.cancel(&self.session, id) {
                tracing::warn!(session = %self.session, "Failed to cancel invoke {}: {}", id, e);
            }
        }
        self.state = EngineState::Suspended;
        self.observer.on_state(&self.session, self.state);
    }

    /// Starts the invokes recorded as active again, under their old ids.
    fn restart_invokes(&mut self) -> Result<(), EngineError> {
        let document = Arc::clone(&self.document);
        for id in self.active_invokes() {
            let Some(invoke) = document.invoke(id.node) else {
                return Err(corrupt(format!("invoke node {}", id.node)));
            };
            let content = match &invoke.content {
                Some(expr) => match self.evaluate_value(&document, expr.as_ref()) {
                    Ok(value) => value,
                    Err(e) => {
                        self.ctx.remove_invoke(&id)?;
                        self.raise_error(e)?;
                        continue;
                    }
                },
                None => Value::Null,
            };
            let request = InvokeRequest {
                session: self.session.clone(),
                id: id.clone(),
                service: invoke.service.clone(),
                src: invoke.src.clone(),
                content,
                autoforward: invoke.autoforward,
            };
            match self.controller.start(request) {
                Ok(()) => tracing::debug!(session = %self.session, "Restarted invoke {}", id),
                Err(e) => {
                    self.ctx.remove_invoke(&id)?;
                    self.raise_error(Box::new(CommunicationFault::new(self.session.clone(), None, e)))?;
                }
            }
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), EngineError> {
        self.root.add(Key::Version, &FORMAT_VERSION)?;
        self.root.add(Key::SessionId, &self.session.to_string())?;
        self.root.add(Key::DocumentChecksum, &self.document.checksum())?;
        self.root.add(Key::Name, &self.document.name().to_string())?;
        self.set_state(EngineState::Accepted)?;
        self.checkpoint(CheckpointLevel::StableState)
    }

    fn set_state(&mut self, state: EngineState) -> Result<(), EngineError> {
        if self.state == state {
            return Ok(());
        }
        self.state = state;
        self.root.add(Key::Status, &state.code())?;
        self.observer.on_state(&self.session, state);
        tracing::debug!(session = %self.session, "State {}", state);
        Ok(())
    }

    fn checkpoint(&mut self, level: CheckpointLevel) -> Result<(), EngineError> {
        self.ctx.flush_data_model()?;
        self.log.lock().checkpoint(level as u8)?;
        tracing::trace!(session = %self.session, "Checkpoint {:?}", level);
        Ok(())
    }

    fn shrink_if_needed(&mut self) -> Result<(), EngineError> {
        let mut log = self.log.lock();
        let before = log.log_len();
        if log.shrink_if_needed()? {
            tracing::info!(
                session = %self.session,
                "Shrunk session log from {} to {} bytes",
                before,
                log.log_len()
            );
        }
        Ok(())
    }

    fn stored_done_data(&self) -> Result<Option<Value>, EngineError> {
        match self.root.try_get::<String>(Key::DoneData)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("session", &self.session)
            .field("document", &self.document.name())
            .field("state", &self.state)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}
