//! Caller-driven cancellation.
//!
//! A [`CancelToken`] is handed down from the top-level request to every
//! oracle call. Cancelling it makes in-flight calls return
//! [`crate::error::OracleError::Cancelled`] promptly instead of waiting for
//! the provider.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation signal backed by a `watch` channel.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives inside `self`, so `wait_for` cannot observe a
        // closed channel while this future is alive.
        let _ = rx.wait_for(|c| *c).await;
    }
}
