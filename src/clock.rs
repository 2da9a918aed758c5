//! Time sources for the governance core.
//!
//! Every component reads "now" through a [`Clock`] so that window and expiry
//! logic can be driven deterministically in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of the current time, expressed as a duration since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;

    /// Current Unix timestamp in whole seconds.
    fn unix_secs(&self) -> u64 {
        self.now().as_secs()
    }
}

/// Wall clock used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

/// Manually driven clock for tests.
///
/// Clones share the same underlying instant, so a test can hand one clone to
/// the component under test and advance time through another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(micros(start))),
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Move time forward; saturates at the largest representable instant.
    pub fn advance(&self, by: Duration) {
        let by = micros(by);
        let _ = self
            .micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(by))
            });
    }

    pub fn set(&self, to: Duration) {
        self.micros.store(micros(to), Ordering::SeqCst);
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

/// Shared handle to a clock, as held by every component.
pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::from_secs(100);
        let handle = clock.clone();

        handle.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), Duration::from_secs(105));

        handle.set(Duration::from_secs(10));
        assert_eq!(clock.unix_secs(), 10);
    }

    #[test]
    fn test_manual_clock_saturates_instead_of_wrapping() {
        let clock = ManualClock::new(Duration::MAX);
        assert_eq!(clock.now(), Duration::from_micros(u64::MAX));

        let clock = ManualClock::from_secs(100);
        clock.advance(Duration::MAX);
        assert_eq!(clock.now(), Duration::from_micros(u64::MAX));

        clock.set(Duration::MAX);
        assert_eq!(clock.now(), Duration::from_micros(u64::MAX));
    }

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemClock.unix_secs() > 1_600_000_000);
    }
}
