//! External event queue of a session.
//!
//! Single consumer (the interpreter), any number of producers. The queue is
//! unbounded unless a capacity is given. When every sender is gone the
//! interpreter suspends at its next wait.

use crate::event::Event;
use thiserror::Error;
use tokio::sync::mpsc;

/// An event the queue did not accept.
#[derive(Debug, Error)]
pub enum SendError {
    /// The session is no longer reading its queue.
    #[error("event queue closed, dropped '{}'", .0.name)]
    Closed(Event),
    /// A bounded queue has no room.
    #[error("event queue full, rejected '{}'", .0.name)]
    Full(Event),
}

impl SendError {
    /// Returns the rejected event.
    pub fn into_event(self) -> Event {
        match self {
            SendError::Closed(event) | SendError::Full(event) => event,
        }
    }
}

/// Creates an external queue, bounded if `capacity` is given.
pub fn channel(capacity: Option<usize>) -> (EventSender, ExternalQueue) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (
                EventSender {
                    inner: SenderInner::Bounded(tx),
                },
                ExternalQueue {
                    inner: ReceiverInner::Bounded(rx),
                },
            )
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                EventSender {
                    inner: SenderInner::Unbounded(tx),
                },
                ExternalQueue {
                    inner: ReceiverInner::Unbounded(rx),
                },
            )
        }
    }
}

#[derive(Clone)]
enum SenderInner {
    Bounded(mpsc::Sender<Event>),
    Unbounded(mpsc::UnboundedSender<Event>),
}

/// Producer side of an external queue.
#[derive(Clone)]
pub struct EventSender {
    inner: SenderInner,
}

impl EventSender {
    /// Sends an event, waiting for room if the queue is bounded and full.
    pub async fn send(&self, event: Event) -> Result<(), SendError> {
        match &self.inner {
            SenderInner::Bounded(tx) => tx.send(event).await.map_err(|e| SendError::Closed(e.0)),
            SenderInner::Unbounded(tx) => tx.send(event).map_err(|e| SendError::Closed(e.0)),
        }
    }

    /// Sends without waiting.
    pub fn try_send(&self, event: Event) -> Result<(), SendError> {
        match &self.inner {
            SenderInner::Bounded(tx) => tx.try_send(event).map_err(|e| match e {
                mpsc::error::TrySendError::Full(event) => SendError::Full(event),
                mpsc::error::TrySendError::Closed(event) => SendError::Closed(event),
            }),
            SenderInner::Unbounded(tx) => tx.send(event).map_err(|e| SendError::Closed(e.0)),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.inner {
            SenderInner::Bounded(tx) => tx.is_closed(),
            SenderInner::Unbounded(tx) => tx.is_closed(),
        }
    }
}

impl std::fmt::Debug for EventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum ReceiverInner {
    Bounded(mpsc::Receiver<Event>),
    Unbounded(mpsc::UnboundedReceiver<Event>),
}

/// Consumer side of an external queue.
pub struct ExternalQueue {
    inner: ReceiverInner,
}

impl ExternalQueue {
    /// Waits for the next event. Returns `None` once all senders are gone
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.recv().await,
            ReceiverInner::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Takes an event if one is ready.
    pub fn try_recv(&mut self) -> Option<Event> {
        match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.try_recv().ok(),
            ReceiverInner::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

impl std::fmt::Debug for ExternalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalQueue").finish_non_exhaustive()
    }
}
