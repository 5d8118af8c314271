//! Cooperative shutdown signal shared by every task.
//!
//! A `watch` channel carries the process-wide flag: it transitions
//! false -> true exactly once and stays there. Each loop (accept, per
//! connection read, heartbeat) holds a clone and observes the flag as its
//! cancellation point. Triggering is idempotent; a second termination
//! request only re-sends the value already set.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable handle to the process-wide shutdown flag.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Flip the flag. Safe to call any number of times.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Non-blocking observation of the flag.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the flag is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
