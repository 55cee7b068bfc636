//! Wall-clock milliseconds anchored to tokio's clock.
//!
//! Timestamps must survive a restart (durable cache entries), so they are unix
//! milliseconds. They advance with `tokio::time::Instant`, which lets tests pause
//! and advance time instead of sleeping.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    base_unix_ms: u64,
    base_instant: Instant,
}

impl Clock {
    /// Anchor at the current system time.
    pub fn system() -> Self {
        let base_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::starting_at(base_unix_ms)
    }

    /// Anchor at an explicit unix timestamp. Mostly useful in tests.
    pub fn starting_at(base_unix_ms: u64) -> Self {
        Self {
            base_unix_ms,
            base_instant: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.base_instant);
        self.base_unix_ms + elapsed.as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
