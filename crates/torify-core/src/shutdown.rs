//! The "shutdown requested" flag shared by every blocking step.
//!
//! Long-running steps (control port discovery, cookie wait, bootstrap polling,
//! onion service publication) check the flag at their step boundaries and
//! race their waits against [`ShutdownSignal::requested`].

use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable, one-way shutdown flag.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Create a new, unset signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Set the flag. Setting it twice is a no-op.
    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown was requested.
    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Fail with [`Error::Cancelled`] if shutdown was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_requested() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve once shutdown is requested.
    pub async fn requested(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed
        // channel here.
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
