//! Cooperative shutdown token.
//!
//! Cloned into every loop and blocking call; `cancel()` releases all waiters.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: RwLock<bool>,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        {
            let mut cancelled = self.inner.cancelled.write();
            if *cancelled {
                return;
            }
            *cancelled = true;
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.read()
    }

    /// Resolves once the token is cancelled. Registration happens before the
    /// flag check so a concurrent `cancel()` cannot be missed.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
