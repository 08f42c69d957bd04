//! Session host: runs many chart sessions as independent tokio tasks.
//!
//! Every session owns one log file, `<data_dir>/<session>.log`. A session
//! that ends suspended keeps its log and can be resumed later, also by a
//! different process. The outcome of a finished session is kept until
//! `wait` or `status` hands it back once.

use crate::config::Config;
use crate::error::RuntimeError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use stepchart_core::invoke::{NoDispatch, NoInvokes};
use stepchart_core::{
    queue, BoxError, CancellationContext, Document, EngineError, EngineObserver, EngineState,
    ErrorKind, Event, EventDispatcher, EventSender, Interpreter, InvokeController, NoopObserver,
    SessionId,
};
use stepchart_wal::FileStream;
use tokio::sync::watch;

/// How a session task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Reached a top-level final state; carries the done data.
    Done(Option<Value>),
    Halted,
    Destroyed,
    /// Stopped at a stable state; the log can be resumed.
    Suspended,
    /// Destroyed after the internal queue kept growing.
    LiveLock { window: usize },
    /// Ended with an error; the log may still be resumable.
    Failed(String),
}

impl SessionOutcome {
    fn from_result(result: &Result<Option<Value>, EngineError>) -> Self {
        match result {
            Ok(done) => SessionOutcome::Done(done.clone()),
            Err(EngineError::Halted) => SessionOutcome::Halted,
            Err(EngineError::Destroyed) => SessionOutcome::Destroyed,
            Err(EngineError::Suspended) => SessionOutcome::Suspended,
            Err(EngineError::LiveLock { window }) => SessionOutcome::LiveLock { window: *window },
            Err(e) => SessionOutcome::Failed(e.to_string()),
        }
    }

    /// Returns whether the session can be resumed from its log.
    pub fn is_resumable(&self) -> bool {
        matches!(self, SessionOutcome::Suspended | SessionOutcome::Failed(_))
    }
}

/// Status of a session known to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Running(EngineState),
    Finished(SessionOutcome),
}

/// Host statistics.
#[derive(Debug, Default)]
pub struct HostStats {
    pub sessions_started: AtomicU64,
    pub sessions_resumed: AtomicU64,
    pub sessions_finished: AtomicU64,
    pub events_sent: AtomicU64,
}

struct SessionHandle {
    generation: u64,
    sender: EventSender,
    cancel: CancellationContext,
    state: Arc<Mutex<EngineState>>,
    outcome: watch::Receiver<Option<SessionOutcome>>,
}

/// Tracks the engine state of a session and passes everything on.
struct StatusObserver {
    state: Arc<Mutex<EngineState>>,
    inner: Arc<dyn EngineObserver>,
}

impl EngineObserver for StatusObserver {
    fn on_state(&self, session: &SessionId, state: EngineState) {
        *self.state.lock() = state;
        self.inner.on_state(session, state);
    }

    fn on_configuration(&self, session: &SessionId, states: &[String]) {
        self.inner.on_configuration(session, states);
    }

    fn on_event(&self, session: &SessionId, event: &Event) {
        self.inner.on_event(session, event);
    }

    fn on_raise(&self, session: &SessionId, event: &Event) {
        self.inner.on_raise(session, event);
    }

    fn on_error(
        &self,
        session: &SessionId,
        kind: ErrorKind,
        error: &(dyn StdError + 'static),
    ) -> Result<(), BoxError> {
        self.inner.on_error(session, kind, error)
    }
}

/// Runs chart sessions.
pub struct SessionHost {
    config: Config,
    controller: Arc<dyn InvokeController>,
    dispatcher: Arc<dyn EventDispatcher>,
    observer: Arc<dyn EngineObserver>,
    sessions: Arc<DashMap<SessionId, SessionHandle>>,
    outcomes: Arc<DashMap<SessionId, SessionOutcome>>,
    generation: AtomicU64,
    stats: Arc<HostStats>,
    shutting_down: AtomicBool,
}

impl SessionHost {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            controller: Arc::new(NoInvokes),
            dispatcher: Arc::new(NoDispatch),
            observer: Arc::new(NoopObserver),
            sessions: Arc::new(DashMap::new()),
            outcomes: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            stats: Arc::new(HostStats::default()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Sets the invoke controller used by every session.
    pub fn with_controller(mut self, controller: Arc<dyn InvokeController>) -> Self {
        self.controller = controller;
        self
    }

    /// Sets the event dispatcher used by every session.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Sets an observer notified by every session.
    pub fn with_observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    /// Starts a new session. Fails if the session already has a log.
    pub fn start(
        &self,
        document: Arc<Document>,
        session: Option<SessionId>,
    ) -> Result<SessionId, RuntimeError> {
        let session = session.unwrap_or_default();
        let path = self.config.storage.log_path(session.as_str())?;
        if path.metadata().map(|m| m.len() > 0).unwrap_or(false) {
            return Err(RuntimeError::SessionExists(session));
        }
        self.launch(document, session.clone())?;
        self.stats.sessions_started.fetch_add(1, Ordering::Relaxed);
        Ok(session)
    }

    /// Resumes a session from its log.
    pub fn resume(&self, document: Arc<Document>, session: SessionId) -> Result<(), RuntimeError> {
        let path = self.config.storage.log_path(session.as_str())?;
        if !path.exists() {
            return Err(RuntimeError::SessionNotFound(session));
        }
        self.launch(document, session)?;
        self.stats.sessions_resumed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Starts the session if it has no log yet, otherwise resumes it.
    pub fn start_or_resume(
        &self,
        document: Arc<Document>,
        session: SessionId,
    ) -> Result<(), RuntimeError> {
        match self.start(document.clone(), Some(session)) {
            Ok(_) => Ok(()),
            Err(RuntimeError::SessionExists(session)) => self.resume(document, session),
            Err(e) => Err(e),
        }
    }

    fn launch(&self, document: Arc<Document>, session: SessionId) -> Result<(), RuntimeError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShuttingDown);
        }
        if self.sessions.contains_key(&session) {
            return Err(RuntimeError::SessionRunning(session));
        }

        let stream = FileStream::open(self.config.storage.log_path(session.as_str())?)?;
        let state = Arc::new(Mutex::new(EngineState::Initializing));
        let observer = Arc::new(StatusObserver {
            state: state.clone(),
            inner: self.observer.clone(),
        });
        let interpreter = Interpreter::builder(document, session.clone())
            .options(self.config.engine.interpreter_options())
            .controller(self.controller.clone())
            .dispatcher(self.dispatcher.clone())
            .observer(observer)
            .open(stream, self.config.storage.log_config())?;
        *state.lock() = interpreter.state();

        let (sender, queue) = queue::channel(self.config.engine.queue_capacity);
        let cancel = CancellationContext::new();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        // Registered before the task runs so a task that ends at once
        // still finds its own entry to remove.
        match self.sessions.entry(session.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RuntimeError::SessionRunning(session));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(SessionHandle {
                    generation,
                    sender,
                    cancel: cancel.clone(),
                    state,
                    outcome: outcome_rx,
                });
            }
        }
        self.outcomes.remove(&session);

        tracing::info!(
            session = %session,
            resumed = interpreter.is_resumed(),
            "Session started"
        );

        let sessions = self.sessions.clone();
        let outcomes = self.outcomes.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let result = interpreter.run(queue, cancel).await;
            let outcome = SessionOutcome::from_result(&result);
            match &outcome {
                SessionOutcome::Failed(e) => {
                    tracing::error!(session = %session, "Session failed: {}", e)
                }
                other => tracing::info!(session = %session, outcome = ?other, "Session ended"),
            }

            outcomes.insert(session.clone(), outcome.clone());
            sessions.remove_if(&session, |_, handle| handle.generation == generation);
            stats.sessions_finished.fetch_add(1, Ordering::Relaxed);
            outcome_tx.send_replace(Some(outcome));
        });

        Ok(())
    }

    /// Delivers an external event, waiting for room if the queue is bounded.
    pub async fn send(&self, session: &SessionId, event: Event) -> Result<(), RuntimeError> {
        let sender = self.sender(session)?;
        sender
            .send(event)
            .await
            .map_err(|_| RuntimeError::SessionClosed(session.clone()))?;
        self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Delivers an external event without waiting.
    pub fn try_send(&self, session: &SessionId, event: Event) -> Result<(), RuntimeError> {
        let sender = self.sender(session)?;
        sender.try_send(event).map_err(|e| match e {
            queue::SendError::Full(_) => RuntimeError::QueueFull(session.clone()),
            queue::SendError::Closed(_) => RuntimeError::SessionClosed(session.clone()),
        })?;
        self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sender(&self, session: &SessionId) -> Result<EventSender, RuntimeError> {
        self.sessions
            .get(session)
            .map(|handle| handle.sender.clone())
            .ok_or_else(|| RuntimeError::SessionNotFound(session.clone()))
    }

    /// Stops a session for good: invokes are cancelled, the session halts.
    pub fn stop(&self, session: &SessionId) -> Result<(), RuntimeError> {
        self.cancel(session)?.stop();
        Ok(())
    }

    /// Destroys a session: its exit sequence runs, then it ends.
    pub fn destroy(&self, session: &SessionId) -> Result<(), RuntimeError> {
        self.cancel(session)?.destroy();
        Ok(())
    }

    /// Suspends a session; its log stays resumable.
    pub fn suspend(&self, session: &SessionId) -> Result<(), RuntimeError> {
        self.cancel(session)?.suspend();
        Ok(())
    }

    fn cancel(&self, session: &SessionId) -> Result<CancellationContext, RuntimeError> {
        self.sessions
            .get(session)
            .map(|handle| handle.cancel.clone())
            .ok_or_else(|| RuntimeError::SessionNotFound(session.clone()))
    }

    /// Returns the status of a running or finished session.
    ///
    /// A finished session is reported once; its outcome is then forgotten.
    pub fn status(&self, session: &SessionId) -> Option<SessionStatus> {
        if let Some(handle) = self.sessions.get(session) {
            return Some(SessionStatus::Running(*handle.state.lock()));
        }
        self.outcomes
            .remove(session)
            .map(|(_, outcome)| SessionStatus::Finished(outcome))
    }

    /// Waits for a session to end and takes its outcome.
    pub async fn wait(&self, session: &SessionId) -> Result<SessionOutcome, RuntimeError> {
        let outcome = self.wait_outcome(session).await?;
        self.outcomes.remove(session);
        Ok(outcome)
    }

    async fn wait_outcome(&self, session: &SessionId) -> Result<SessionOutcome, RuntimeError> {
        let outcome = self.sessions.get(session).map(|handle| handle.outcome.clone());
        let mut outcome = match outcome {
            Some(rx) => rx,
            None => {
                return self
                    .outcomes
                    .get(session)
                    .map(|o| o.value().clone())
                    .ok_or_else(|| RuntimeError::SessionNotFound(session.clone()));
            }
        };

        let done = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RuntimeError::Join(format!("session {} task ended without an outcome", session)))?;
        let value = (*done).clone();
        value.ok_or_else(|| RuntimeError::Join(format!("session {} has no outcome", session)))
    }

    /// Number of finished sessions whose outcome has not been taken yet.
    pub fn unclaimed(&self) -> usize {
        self.outcomes.len()
    }

    /// Ids of the running sessions.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn running(&self) -> usize {
        self.sessions.len()
    }

    /// Suspends every running session and waits for all of them to end.
    ///
    /// Outcomes stay available to `wait` and `status`.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let running = self.sessions();
        tracing::info!(sessions = running.len(), "Suspending sessions");
        for session in &running {
            if let Err(e) = self.suspend(session) {
                tracing::warn!(session = %session, "Failed to suspend session: {}", e);
            }
        }
        for session in &running {
            if let Err(e) = self.wait_outcome(session).await {
                tracing::warn!(session = %session, "Failed to wait for session: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::ChartDef;
    use crate::config::ConfigError;
    use tempfile::tempdir;

    fn host(dir: &std::path::Path) -> SessionHost {
        let mut config = Config::default();
        config.storage.data_dir = dir.to_path_buf();
        SessionHost::new(config)
    }

    fn toggle() -> Arc<Document> {
        let chart = ChartDef::from_json(
            r#"{"name": "toggle", "states": [
                {"id": "off", "transitions": [{"event": "flip", "target": "on"}, {"event": "quit", "target": "end"}]},
                {"id": "on", "transitions": [{"event": "flip", "target": "off"}, {"event": "quit", "target": "end"}]},
                {"id": "end", "type": "final"}
            ]}"#,
        )
        .unwrap();
        Arc::new(chart.to_document().unwrap())
    }

    #[tokio::test]
    async fn test_start_send_wait() {
        let dir = tempdir().unwrap();
        let host = host(dir.path());
        let id = host.start(toggle(), None).unwrap();
        assert!(matches!(host.status(&id), Some(SessionStatus::Running(_))));

        host.send(&id, Event::external("flip")).await.unwrap();
        host.send(&id, Event::external("quit")).await.unwrap();
        assert_eq!(host.wait(&id).await.unwrap(), SessionOutcome::Done(None));

        assert_eq!(host.running(), 0);
        assert!(dir.path().join(format!("{}.log", id)).exists());
        assert!(matches!(
            host.send(&id, Event::external("flip")).await,
            Err(RuntimeError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let dir = tempdir().unwrap();
        let host = host(dir.path());
        let id = SessionId::from("twice");
        host.start(toggle(), Some(id.clone())).unwrap();
        assert!(matches!(
            host.start(toggle(), Some(id.clone())),
            Err(RuntimeError::SessionRunning(_)) | Err(RuntimeError::SessionExists(_))
        ));
        host.stop(&id).unwrap();
        assert_eq!(host.wait(&id).await.unwrap(), SessionOutcome::Halted);
    }

    #[tokio::test]
    async fn test_suspend_then_resume() {
        let dir = tempdir().unwrap();
        let host = host(dir.path());
        let doc = toggle();
        let id = host.start(doc.clone(), Some(SessionId::from("sr"))).unwrap();
        host.send(&id, Event::external("flip")).await.unwrap();
        host.suspend(&id).unwrap();
        let outcome = host.wait(&id).await.unwrap();
        assert!(outcome.is_resumable());

        assert!(matches!(
            host.start(doc.clone(), Some(id.clone())),
            Err(RuntimeError::SessionExists(_))
        ));
        host.resume(doc, id.clone()).unwrap();
        host.send(&id, Event::external("quit")).await.unwrap();
        assert_eq!(host.wait(&id).await.unwrap(), SessionOutcome::Done(None));
        assert_eq!(host.stats().sessions_resumed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_outcomes_are_released_once_taken() {
        let dir = tempdir().unwrap();
        let host = host(dir.path());
        let mut ids = Vec::new();
        for _ in 0..8 {
            let id = host.start(toggle(), None).unwrap();
            host.send(&id, Event::external("quit")).await.unwrap();
            ids.push(id);
        }
        for id in &ids {
            assert_eq!(host.wait(id).await.unwrap(), SessionOutcome::Done(None));
        }
        assert_eq!(host.unclaimed(), 0);
        assert_eq!(host.running(), 0);
        assert!(host.status(&ids[0]).is_none());
        assert!(matches!(
            host.wait(&ids[0]).await,
            Err(RuntimeError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_ids_stay_inside_data_dir() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir(&data).unwrap();
        let host = host(&data);

        for id in ["../escape", "nested/id", ""] {
            assert!(matches!(
                host.start(toggle(), Some(SessionId::from(id))),
                Err(RuntimeError::Config(ConfigError::InvalidSessionId(_)))
            ));
        }
        assert!(matches!(
            host.resume(toggle(), SessionId::from("../escape")),
            Err(RuntimeError::Config(ConfigError::InvalidSessionId(_)))
        ));
        assert!(!dir.path().join("escape.log").exists());
        assert_eq!(host.running(), 0);
    }

    #[tokio::test]
    async fn test_resume_unknown_session() {
        let dir = tempdir().unwrap();
        let host = host(dir.path());
        assert!(matches!(
            host.resume(toggle(), SessionId::from("ghost")),
            Err(RuntimeError::SessionNotFound(_))
        ));
        assert!(host.status(&SessionId::from("ghost")).is_none());
        assert!(host.stop(&SessionId::from("ghost")).is_err());
    }

    #[tokio::test]
    async fn test_destroy_and_shutdown() {
        let dir = tempdir().unwrap();
        let host = host(dir.path());
        let a = host.start(toggle(), None).unwrap();
        let b = host.start(toggle(), None).unwrap();
        host.destroy(&a).unwrap();
        assert_eq!(host.wait(&a).await.unwrap(), SessionOutcome::Destroyed);

        host.shutdown().await;
        assert_eq!(host.running(), 0);
        assert_eq!(
            host.status(&b),
            Some(SessionStatus::Finished(SessionOutcome::Suspended))
        );
        assert_eq!(host.status(&b), None);
        assert_eq!(host.unclaimed(), 0);
        assert!(matches!(
            host.start(toggle(), None),
            Err(RuntimeError::ShuttingDown)
        ));
        assert_eq!(host.stats().sessions_started.load(Ordering::Relaxed), 2);
    }
}
