//! Cached wall-clock seconds shared across the tracker layer.
//!
//! Tracker timing is all epoch-second arithmetic, so the layer reads one
//! shared counter the driver refreshes once per loop turn instead of
//! calling into the OS at every comparison. Tests pin it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Cheaply cloneable epoch-seconds source.
#[derive(Debug, Clone)]
pub struct Clock {
    seconds: Arc<AtomicU64>,
}

impl Clock {
    /// Creates a clock primed from the system time.
    pub fn system() -> Self {
        Self::fixed(epoch_now())
    }

    /// Creates a clock pinned to `seconds`; it only moves when told to.
    pub fn fixed(seconds: u64) -> Self {
        Self {
            seconds: Arc::new(AtomicU64::new(seconds)),
        }
    }

    /// Current cached time in seconds since the epoch.
    pub fn now(&self) -> u64 {
        self.seconds.load(Ordering::Relaxed)
    }

    /// Re-reads the system time.
    pub fn refresh(&self) {
        self.seconds.store(epoch_now(), Ordering::Relaxed);
    }

    /// Pins the cached time, for tests and simulations.
    pub fn set(&self, seconds: u64) {
        self.seconds.store(seconds, Ordering::Relaxed);
    }

    /// Moves the cached time forward.
    pub fn advance(&self, seconds: u64) {
        self.seconds.fetch_add(seconds, Ordering::Relaxed);
    }
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock_only_moves_when_told() {
        let clock = Clock::fixed(100);
        assert_eq!(clock.now(), 100);

        clock.advance(5);
        assert_eq!(clock.now(), 105);

        clock.set(42);
        assert_eq!(clock.now(), 42);
    }

    #[test]
    fn test_clones_share_time() {
        let clock = Clock::fixed(7);
        let other = clock.clone();

        clock.advance(3);
        assert_eq!(other.now(), 10);
    }

    #[test]
    fn test_system_clock_is_recent() {
        let clock = Clock::system();
        // Sanity bound: after 2020, before year ~2100.
        assert!(clock.now() > 1_577_836_800);
        assert!(clock.now() < 4_102_444_800);
    }
}
