//! Cancellation context for a running session.
//!
//! Stop, destroy and suspend requests compose into one context observed at
//! the external-event wait. The first request wins; later ones are ignored.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Why a session was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Halt immediately. The session cannot be resumed.
    Stop,
    /// Run the exit sequence, then end the session.
    Destroy,
    /// Cancel invokes and stop; the log stays at the last stable checkpoint.
    Suspend,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Stop => write!(f, "stop"),
            CancelReason::Destroy => write!(f, "destroy"),
            CancelReason::Suspend => write!(f, "suspend"),
        }
    }
}

/// Shared cancellation state. Clones observe the same requests.
#[derive(Clone)]
pub struct CancellationContext {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancellationContext {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn stop(&self) {
        self.request(CancelReason::Stop);
    }

    pub fn destroy(&self) {
        self.request(CancelReason::Destroy);
    }

    pub fn suspend(&self) {
        self.request(CancelReason::Suspend);
    }

    /// Records `reason` unless another reason was requested first.
    pub fn request(&self, reason: CancelReason) {
        let accepted = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if accepted {
            tracing::debug!("Cancellation requested: {}", reason);
        }
    }

    /// Returns the request that fired, if any.
    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Waits until a cancellation is requested.
    pub async fn cancelled(&mut self) -> CancelReason {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                // All senders dropped: nothing can cancel any more.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancellationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationContext")
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let cancel = CancellationContext::new();
        assert!(!cancel.is_cancelled());

        cancel.suspend();
        cancel.destroy();
        assert_eq!(cancel.reason(), Some(CancelReason::Suspend));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let cancel = CancellationContext::new();
        let mut waiter = cancel.clone();

        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.destroy();

        let reason = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CancelReason::Destroy);
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_immediately() {
        let mut cancel = CancellationContext::new();
        cancel.stop();
        assert_eq!(cancel.cancelled().await, CancelReason::Stop);
    }
}
