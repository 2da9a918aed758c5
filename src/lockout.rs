//! Failed-attempt tracking and temporary client blocking.
//!
//! Failures are logged per client in a sliding window with a fixed lookback.
//! Once a client accumulates `max_attempts` failures inside the lookback it is
//! blocked for `lockout_duration`. Blocks expire lazily on lookup; the failure
//! log is left alone, so residual failures inside the lookback re-block on
//! the next failure.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::algorithms::{AlgorithmConfig, SlidingWindowCounter, DEFAULT_MAX_TRACKED_KEYS};
use crate::clock::SharedClock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub lockout_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub lookback: Duration,
    /// Clear a client's failure history on successful authentication.
    pub reset_on_success: bool,
    pub max_tracked_keys: usize,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_duration: Duration::from_secs(15 * 60),
            lookback: Duration::from_secs(60 * 60),
            reset_on_success: false,
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
        }
    }
}

pub struct LockoutTracker {
    config: LockoutConfig,
    clock: SharedClock,
    failures: SlidingWindowCounter,
    blocked: Mutex<HashMap<String, Duration>>,
}

impl LockoutTracker {
    pub fn new(config: LockoutConfig, clock: SharedClock) -> Self {
        let window = AlgorithmConfig::new(config.max_attempts, config.lookback)
            .with_max_tracked_keys(config.max_tracked_keys);
        Self {
            failures: SlidingWindowCounter::new(window, clock.clone()),
            blocked: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.blocked_for(ip).is_some()
    }

    /// Time left on the client's block, if any. Expired blocks are removed.
    pub fn blocked_for(&self, ip: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut blocked = self.blocked.lock();

        let expiry = *blocked.get(ip)?;
        if now < expiry {
            Some(expiry - now)
        } else {
            blocked.remove(ip);
            None
        }
    }

    /// Record a failed attempt. Returns true if the client is now blocked.
    pub fn record_failure(&self, ip: &str) -> bool {
        let now = self.clock.now();
        let (logged, failures) = self.failures.record_counted(ip, now);

        // a full log means the threshold was already reached in the lookback
        let threshold_reached = !logged || failures >= self.config.max_attempts as usize;
        if !threshold_reached {
            return false;
        }

        let expiry = now.saturating_add(self.config.lockout_duration);
        self.blocked.lock().insert(ip.to_string(), expiry);
        warn!(
            ip = %ip,
            failures,
            lockout_secs = self.config.lockout_duration.as_secs(),
            "Client blocked after repeated failures"
        );
        true
    }

    /// Note a successful attempt. History is only cleared when
    /// `reset_on_success` is set; returns whether anything was cleared.
    pub fn record_success(&self, ip: &str) -> bool {
        if !self.config.reset_on_success {
            return false;
        }
        self.failures.reset(ip)
    }

    /// Administrative reset: forget failures and lift any block.
    pub fn reset(&self, ip: &str) {
        self.failures.reset(ip);
        if self.blocked.lock().remove(ip).is_some() {
            info!(ip = %ip, "Client block lifted by reset");
        }
    }

    pub fn failure_count(&self, ip: &str) -> usize {
        self.failures.count(ip)
    }

    pub fn blocked_clients(&self) -> usize {
        let now = self.clock.now();
        self.blocked
            .lock()
            .values()
            .filter(|expiry| now < **expiry)
            .count()
    }

    /// Drop expired blocks and failure logs that fell out of the lookback.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let expired = {
            let mut blocked = self.blocked.lock();
            let before = blocked.len();
            blocked.retain(|_, expiry| now < *expiry);
            before - blocked.len()
        };
        expired + self.failures.sweep_at(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn tracker(config: LockoutConfig) -> (LockoutTracker, ManualClock) {
        let clock = ManualClock::from_secs(10_000);
        (LockoutTracker::new(config, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_fifth_failure_blocks_and_block_expires() {
        let (tracker, clock) = tracker(LockoutConfig::default());
        let ip = "1.2.3.4";

        for _ in 0..4 {
            assert!(!tracker.record_failure(ip));
            clock.advance(Duration::from_secs(60));
        }
        assert!(tracker.record_failure(ip));
        assert!(tracker.is_blocked(ip));

        clock.advance(Duration::from_secs(16 * 60));
        assert!(!tracker.is_blocked(ip));
        assert_eq!(tracker.failure_count(ip), 5);
    }

    #[test]
    fn test_residual_failures_reblock_immediately() {
        let (tracker, clock) = tracker(LockoutConfig::default());
        for _ in 0..5 {
            tracker.record_failure("ip");
        }
        clock.advance(Duration::from_secs(16 * 60));
        assert!(!tracker.is_blocked("ip"));

        assert!(tracker.record_failure("ip"));
        assert!(tracker.is_blocked("ip"));
    }

    #[test]
    fn test_failures_outside_lookback_do_not_count() {
        let (tracker, clock) = tracker(LockoutConfig::default());
        for _ in 0..4 {
            tracker.record_failure("ip");
        }
        clock.advance(Duration::from_secs(61 * 60));
        assert!(!tracker.record_failure("ip"));
        assert_eq!(tracker.failure_count("ip"), 1);
    }

    #[test]
    fn test_blocked_for_reports_remaining_time() {
        let (tracker, clock) = tracker(LockoutConfig::default());
        for _ in 0..5 {
            tracker.record_failure("ip");
        }
        clock.advance(Duration::from_secs(5 * 60));
        assert_eq!(tracker.blocked_for("ip"), Some(Duration::from_secs(10 * 60)));
        assert_eq!(tracker.blocked_for("other"), None);
    }

    #[test]
    fn test_success_keeps_history_by_default() {
        let (tracker, _) = tracker(LockoutConfig::default());
        tracker.record_failure("ip");
        assert!(!tracker.record_success("ip"));
        assert_eq!(tracker.failure_count("ip"), 1);
    }

    #[test]
    fn test_success_clears_history_when_enabled() {
        let (tracker, _) = tracker(LockoutConfig {
            reset_on_success: true,
            ..LockoutConfig::default()
        });
        tracker.record_failure("ip");
        assert!(tracker.record_success("ip"));
        assert_eq!(tracker.failure_count("ip"), 0);
    }

    #[test]
    fn test_reset_lifts_block() {
        let (tracker, _) = tracker(LockoutConfig::default());
        for _ in 0..5 {
            tracker.record_failure("ip");
        }
        tracker.reset("ip");
        assert!(!tracker.is_blocked("ip"));
        assert_eq!(tracker.failure_count("ip"), 0);
    }

    #[test]
    fn test_huge_lockout_duration_saturates() {
        let (tracker, clock) = tracker(LockoutConfig {
            lockout_duration: Duration::MAX,
            lookback: Duration::MAX,
            ..LockoutConfig::default()
        });
        for _ in 0..4 {
            assert!(!tracker.record_failure("ip"));
        }
        assert!(tracker.record_failure("ip"));
        assert!(tracker.is_blocked("ip"));

        clock.advance(Duration::from_secs(365 * 24 * 60 * 60));
        assert!(tracker.is_blocked("ip"));
        assert_eq!(tracker.sweep(), 0);
    }

    #[test]
    fn test_sweep_clears_expired_state() {
        let (tracker, clock) = tracker(LockoutConfig::default());
        for _ in 0..5 {
            tracker.record_failure("ip");
        }
        assert_eq!(tracker.blocked_clients(), 1);

        clock.advance(Duration::from_secs(2 * 60 * 60));
        assert_eq!(tracker.sweep(), 2);
        assert_eq!(tracker.blocked_clients(), 0);
    }
}
