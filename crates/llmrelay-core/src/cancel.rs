use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// The inbound request's cancellation signal. §5: "the canonical
/// 'client went away' signal" — must be distinguished from a transport
/// RST, which counts as a channel failure rather than a client cancel.
/// For a unary response the in-flight `handle` future is simply dropped
/// by the server on disconnect; for a streamed response the handler
/// fires `cancel()` from the response body's `Drop` impl, since the
/// pump task outlives the future that returned the body.
#[derive(Clone)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called; resolves immediately
    /// if it already has been.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.notify.notified().await;
        }
    }
}
