use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Cloneable cancellation signal shared by the transport, wait captures and
/// listener readers. Cancelling is idempotent.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug)]
struct CancelInner {
    sender: broadcast::Sender<()>,
    cancelled: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(CancelInner {
                sender,
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Returns `true` only for the call that actually cancelled.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.inner.sender.send(());
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut receiver = self.inner.sender.subscribe();
        if self.is_cancelled() {
            return;
        }
        let _ = receiver.recv().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
