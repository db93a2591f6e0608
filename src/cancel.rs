//! Ambient cancellation (§6): every Blob Store operation and every long-running Block
//! Manager operation accepts a token and must return promptly once it is triggered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{BackendErrorKind, CoreResult};

/// A cheaply-cloned cancellation handle. `cancel()` is typically called from a signal
/// handler or a caller-side timeout; `check()` is called at retry/loop boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns `Err(Canceled)` if the token has been triggered, `Ok(())` otherwise.
    pub fn check(&self) -> CoreResult<()> {
        if self.is_cancelled() {
            Err(BackendErrorKind::Canceled.into())
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
        assert!(CancellationToken::new().check().is_ok());
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.check().is_err());
    }
}
