//! Cancellation token for in-flight operations.

use async_channel::{Receiver, Sender};

/// Cloneable token; cancelling any clone cancels all of them.
///
/// Built on a channel that never carries a message: cancelling closes it,
/// which wakes every pending [`CancellationToken::cancelled`] call.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl CancellationToken {
    /// New, not cancelled token
    pub fn new() -> Self {
        let (tx, rx) = async_channel::bounded(1);
        Self { tx, rx }
    }

    /// Cancel. Idempotent.
    pub fn cancel(&self) {
        self.tx.close();
    }

    /// Whether [`cancel`](Self::cancel) was called
    pub fn is_cancelled(&self) -> bool {
        self.rx.is_closed()
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        let _ = self.rx.recv().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
