//! Invoked services and outgoing events.
//!
//! The engine drives invokes through an [`InvokeController`] and sends
//! events through an [`EventDispatcher`]. Both are opaque to it beyond
//! these calls; any error they return becomes an `error.communication`
//! event in the session.

use crate::document::DocId;
use crate::error::BoxError;
use crate::event::{Event, InvokeId, SessionId};
use parking_lot::Mutex;
use serde_json::Value;
use std::time::Duration;

/// Lifecycle of one invoke instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeState {
    NotStarted,
    Starting,
    Active,
    Cancelling,
    Completing,
    Removed,
}

/// Everything a controller needs to start a service.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub session: SessionId,
    pub id: InvokeId,
    pub service: String,
    pub src: Option<String>,
    pub content: Value,
    pub autoforward: bool,
}

/// Starts, cancels and forwards events to invoked services.
///
/// A started service reports back by sending events carrying its
/// [`InvokeId`] to the session's external queue, finishing with
/// `done.invoke.<id>`.
pub trait InvokeController: Send + Sync {
    fn start(&self, request: InvokeRequest) -> Result<(), BoxError>;

    fn cancel(&self, session: &SessionId, id: &InvokeId) -> Result<(), BoxError>;

    fn forward(&self, session: &SessionId, id: &InvokeId, event: &Event) -> Result<(), BoxError>;
}

/// An event leaving the session.
#[derive(Debug, Clone)]
pub struct OutgoingEvent {
    pub event: Event,
    pub target: Option<String>,
    pub target_type: Option<String>,
    pub delay: Option<Duration>,
}

/// Delivers events to targets outside the session.
pub trait EventDispatcher: Send + Sync {
    fn send(&self, session: &SessionId, event: OutgoingEvent) -> Result<(), BoxError>;

    /// Cancels a delayed send by its send id.
    fn cancel(&self, session: &SessionId, send_id: &str) -> Result<(), BoxError>;
}

/// Controller for sessions that declare no invokes; every start fails.
#[derive(Debug, Default)]
pub struct NoInvokes;

impl InvokeController for NoInvokes {
    fn start(&self, request: InvokeRequest) -> Result<(), BoxError> {
        Err(format!("no invoke controller for service '{}'", request.service).into())
    }

    fn cancel(&self, _session: &SessionId, _id: &InvokeId) -> Result<(), BoxError> {
        Ok(())
    }

    fn forward(&self, _session: &SessionId, _id: &InvokeId, _event: &Event) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Dispatcher with no external targets; every send fails.
#[derive(Debug, Default)]
pub struct NoDispatch;

impl EventDispatcher for NoDispatch {
    fn send(&self, _session: &SessionId, event: OutgoingEvent) -> Result<(), BoxError> {
        Err(format!(
            "no dispatcher for target '{}'",
            event.target.as_deref().unwrap_or("")
        )
        .into())
    }

    fn cancel(&self, _session: &SessionId, _send_id: &str) -> Result<(), BoxError> {
        Ok(())
    }
}

/// One call observed by a [`RecordingController`].
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeCall {
    Start(InvokeId),
    Cancel(InvokeId),
    Forward(InvokeId, String),
}

/// Controller that records calls and accepts everything. Useful in tests
/// and for charts whose services are simulated by the host.
#[derive(Debug, Default)]
pub struct RecordingController {
    calls: Mutex<Vec<InvokeCall>>,
}

impl RecordingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<InvokeCall> {
        self.calls.lock().clone()
    }

    /// Ids of started invokes, in start order.
    pub fn started(&self) -> Vec<InvokeId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                InvokeCall::Start(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}

impl InvokeController for RecordingController {
    fn start(&self, request: InvokeRequest) -> Result<(), BoxError> {
        self.calls.lock().push(InvokeCall::Start(request.id));
        Ok(())
    }

    fn cancel(&self, _session: &SessionId, id: &InvokeId) -> Result<(), BoxError> {
        self.calls.lock().push(InvokeCall::Cancel(id.clone()));
        Ok(())
    }

    fn forward(&self, _session: &SessionId, id: &InvokeId, event: &Event) -> Result<(), BoxError> {
        self.calls
            .lock()
            .push(InvokeCall::Forward(id.clone(), event.name.clone()));
        Ok(())
    }
}

/// Generates the chart-visible id of an invoke without an `id` attribute.
pub(crate) fn generated_invoke_value(state_id: &str, node: DocId, instance: u64) -> String {
    format!("{}.{}.{}", state_id, node, instance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_controller() {
        let controller = RecordingController::new();
        let session = SessionId::new();
        let id = InvokeId::new("child", DocId(3), 1);

        controller
            .start(InvokeRequest {
                session: session.clone(),
                id: id.clone(),
                service: "worker".into(),
                src: None,
                content: Value::Null,
                autoforward: false,
            })
            .unwrap();
        controller
            .forward(&session, &id, &Event::external("ping"))
            .unwrap();
        controller.cancel(&session, &id).unwrap();

        assert_eq!(controller.started(), vec![id.clone()]);
        assert_eq!(controller.calls().len(), 3);
        assert_eq!(controller.calls()[2], InvokeCall::Cancel(id));
    }

    #[test]
    fn test_null_collaborators_fail_sends() {
        let session = SessionId::new();
        let sent = NoDispatch.send(
            &session,
            OutgoingEvent {
                event: Event::external("x"),
                target: Some("http://nowhere".into()),
                target_type: None,
                delay: None,
            },
        );
        assert!(sent.is_err());
        assert!(NoDispatch.cancel(&session, "s").is_ok());
    }

    #[test]
    fn test_generated_values_are_unique_per_instance() {
        assert_ne!(
            generated_invoke_value("s", DocId(2), 1),
            generated_invoke_value("s", DocId(2), 2)
        );
    }
}
