//! Cancellation signal checked at external call boundaries.
//!
//! Built on a `watch` channel. A signal can be polled with
//! [`CancelSignal::check`] or awaited with [`CancelSignal::cancelled`] inside
//! a `tokio::select!`.

use tokio::sync::watch;

use crate::error::Cancelled;

/// Sending half: requests cancellation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving half: observed by long-running operations.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelSignal {
    /// A signal that is never cancelled.
    pub fn never() -> Self {
        let (_, signal) = cancel_pair();
        signal
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Fail with [`Cancelled`] if cancellation has been requested.
    pub fn check(&self, operation: &str) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            tracing::debug!(operation, "Cancellation observed");
            return Err(Cancelled::new(operation));
        }
        Ok(())
    }

    /// Resolve once cancellation is requested; pend forever if it never can be.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without cancelling.
                std::future::pending::<()>().await;
            }
        }
    }
}
