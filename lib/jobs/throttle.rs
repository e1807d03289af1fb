use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Process-wide "paused until" gate for outbound accrual calls.
///
/// The deadline is stored as milliseconds since `origin` in one atomic cell, so reads on the
/// hot path never take a lock. `pause` overwrites: the last writer wins and durations never add up.
#[derive(Debug)]
pub struct Throttle {
    origin: Instant,
    paused_until_ms: AtomicU64,
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}

impl Throttle {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            paused_until_ms: AtomicU64::new(0),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.now_ms() < self.paused_until_ms.load(Ordering::Acquire)
    }

    pub fn pause(&self, duration: Duration) {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let until = self.now_ms().saturating_add(millis);
        self.paused_until_ms.store(until, Ordering::Release);
    }

    /// Time left in the current pause, zero when not paused.
    pub fn remaining(&self) -> Duration {
        let until = self.paused_until_ms.load(Ordering::Acquire);
        Duration::from_millis(until.saturating_sub(self.now_ms()))
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
