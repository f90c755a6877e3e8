//! Broadcast-once completion signal for background indexing.

use std::sync::Arc;

use tokio::sync::watch;

/// Published at most once; observable by any number of waiters, including
/// ones that start waiting after the fact.
///
/// Publishing never blocks, whether or not anyone is listening.
#[derive(Debug, Clone)]
pub struct IndexSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for IndexSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark indexing complete. Returns `true` only for the call that
    /// actually flipped the signal.
    pub fn publish(&self) -> bool {
        self.tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    #[must_use]
    pub fn is_published(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal is published. Dropping the future abandons
    /// the wait without side effects.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while this
        // future is alive.
        let _ = rx.wait_for(|done| *done).await;
    }
}
