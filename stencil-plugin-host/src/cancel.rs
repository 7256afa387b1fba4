//! Caller-supplied cancellation signal
//!
//! Long-running operations (toolchain downloads, archive extraction, remote
//! fetches) check the token at iteration boundaries. An in-progress wasm
//! call is not preempted; cancellation takes effect at the next boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Operation aborted by the caller.
#[derive(Debug, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Cheaply cloneable cancellation token shared between a caller and the
/// operations it started.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Error out if the token has been cancelled. Called at iteration
    /// boundaries.
    pub fn bail(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.bail().is_ok());

        clone.cancel();
        assert!(token.is_cancelled());
        assert!(token.bail().is_err());
    }
}
