//! Injected time (§5, §9): the 10-minute index-flush deadline, the List Cache's TTL, the Block
//! Cache's touch threshold, and the on-disk index cache's unused-entry expiry are all expressed
//! against a `Clock` rather than `SystemTime::now()` directly, so tests can freeze or advance
//! time. The background block-cache sweeper still sleeps real wall-clock time between passes
//! (a poll loop, not a deadline comparison), so it is the one cache-adjacent timing not routed
//! through this trait.
//!
//! No direct teacher counterpart (`rustic_core` reads wall-clock time directly wherever it
//! needs it); shaped like [`crate::cancel::CancellationToken`]'s "atomic behind a cheap,
//! cloneable handle" idiom.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of unix-second timestamps.
pub trait Clock: Send + Sync {
    fn now_seconds(&self) -> u64;
}

/// Reads the real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// A clock tests can freeze and advance explicitly.
#[derive(Debug, Clone)]
pub struct FrozenClock(Arc<AtomicU64>);

impl FrozenClock {
    #[must_use]
    pub fn new(start_seconds: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start_seconds)))
    }

    pub fn advance(&self, by_seconds: u64) {
        self.0.fetch_add(by_seconds, Ordering::SeqCst);
    }

    pub fn set(&self, seconds: u64) {
        self.0.store(seconds, Ordering::SeqCst);
    }
}

impl Clock for FrozenClock {
    fn now_seconds(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_clock_only_advances_on_request() {
        let clock = FrozenClock::new(1_000);
        assert_eq!(clock.now_seconds(), 1_000);
        clock.advance(5);
        assert_eq!(clock.now_seconds(), 1_005);
    }
}
