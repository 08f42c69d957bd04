//! Observation hooks for hosts (logging, dead-letter handling, metrics).

use crate::engine::EngineState;
use crate::error::{BoxError, ErrorKind};
use crate::event::{Event, SessionId};
use std::error::Error as StdError;

/// Receives notifications from a running interpreter.
///
/// All methods have empty defaults. They run inline on the interpreter's
/// task and must not block.
pub trait EngineObserver: Send + Sync {
    /// The interpreter changed state.
    fn on_state(&self, _session: &SessionId, _state: EngineState) {}

    /// The configuration changed; ids of the active states in entry order.
    fn on_configuration(&self, _session: &SessionId, _states: &[String]) {}

    /// An event was taken for processing.
    fn on_event(&self, _session: &SessionId, _event: &Event) {}

    /// An event was placed on the internal queue.
    fn on_raise(&self, _session: &SessionId, _event: &Event) {}

    /// Executable content failed and was turned into an error event.
    fn on_error(
        &self,
        _session: &SessionId,
        _kind: ErrorKind,
        _error: &(dyn StdError + 'static),
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl EngineObserver for NoopObserver {}

/// Reports `error` to `observer`. A failure of the observer itself is
/// logged once and dropped.
pub(crate) fn report_error(
    observer: &dyn EngineObserver,
    session: &SessionId,
    kind: ErrorKind,
    error: &(dyn StdError + 'static),
) {
    if let Err(e) = observer.on_error(session, kind, error) {
        tracing::warn!(session = %session, "Observer failed to report {}: {}", kind, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing {
        calls: AtomicUsize,
    }

    impl EngineObserver for Failing {
        fn on_error(
            &self,
            _session: &SessionId,
            _kind: ErrorKind,
            _error: &(dyn StdError + 'static),
        ) -> Result<(), BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("sink unavailable".into())
        }
    }

    #[test]
    fn test_observer_failure_is_swallowed() {
        let observer = Failing {
            calls: AtomicUsize::new(0),
        };
        let err: BoxError = "boom".into();
        report_error(&observer, &SessionId::new(), ErrorKind::Execution, err.as_ref());
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_noop_observer_accepts_errors() {
        let err: BoxError = "boom".into();
        assert!(NoopObserver
            .on_error(&SessionId::new(), ErrorKind::Platform, err.as_ref())
            .is_ok());
    }
}
