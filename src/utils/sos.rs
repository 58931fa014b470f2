//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! A thread-safe, async-aware cancellation token that can be cloned across
//! tasks, awaited for cancellation, and raced against futures in `select!`
//! patterns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// notifies all waiters.
#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    /// Create a new, uncancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all waiters.
    ///
    /// After this call, `cancelled()` returns `true` and all pending
    /// `wait()` futures complete.
    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    /// Check if cancellation has been signaled.
    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation to be signaled.
    ///
    /// Returns immediately if already cancelled.
    pub async fn wait(&self) {
        if self.cancelled() {
            return;
        }
        let notified = self.internal.notify.notified();
        tokio::pin!(notified);
        // Register before the re-check so a cancel landing in between
        // cannot be missed.
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }
}
