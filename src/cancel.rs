//! Cooperative cancellation signal shared across storage, compactor, and
//! query execution. Cancel-first is the only supported shutdown
//! sequence: callers must flip this before waiting on workers, never after.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns `Cancelled` if the token has already fired; used at the top
    /// of every externally callable operation and at bounded intervals
    /// during scans/writes.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::TinyObsError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let tok = CancelToken::new();
        assert!(tok.check().is_ok());
    }

    #[test]
    fn cancelled_token_errs() {
        let tok = CancelToken::new();
        tok.cancel();
        assert!(matches!(
            tok.check(),
            Err(crate::error::TinyObsError::Cancelled)
        ));
    }

    #[test]
    fn clones_share_state() {
        let tok = CancelToken::new();
        let clone = tok.clone();
        clone.cancel();
        assert!(tok.is_cancelled());
    }
}
