//! Wall-clock capability.
//!
//! Components receive a [`TimeSource`] instead of reading the system clock
//! directly, so tests can drive time explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds since the Unix epoch.
pub trait TimeSource: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualTime(AtomicU64);

impl ManualTime {
    pub fn new(millis: u64) -> Self {
        Self(AtomicU64::new(millis))
    }

    pub fn set(&self, millis: u64) {
        self.0.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTime {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time() {
        let time = ManualTime::new(1_000);
        time.advance(500);
        assert_eq!(time.now_millis(), 1_500);
        time.set(42);
        assert_eq!(time.now_millis(), 42);
    }

    #[test]
    fn test_system_time_is_after_2020() {
        assert!(SystemTimeSource.now_millis() > 1_577_836_800_000);
    }
}
