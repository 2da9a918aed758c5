//! Rate limiting algorithms module
//!
//! This module contains the admission algorithms used by the rate limiter
//! and the lockout tracker.

pub mod sliding_window;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use sliding_window::SlidingWindowCounter;

/// Default cap on distinct keys tracked by a single counter.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 100_000;

/// Configuration for rate limiting algorithms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    pub max_events: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub max_tracked_keys: usize,
}

impl AlgorithmConfig {
    pub fn new(max_events: u32, window: Duration) -> Self {
        Self {
            max_events,
            window,
            ..Self::default()
        }
    }

    pub fn with_max_tracked_keys(mut self, max_tracked_keys: usize) -> Self {
        self.max_tracked_keys = max_tracked_keys.max(1);
        self
    }
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            max_events: 100,
            window: Duration::from_secs(60),
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
        }
    }
}

/// Trait for rate limiting algorithms
///
/// Decisions are plain values: denial is an expected outcome, not an error.
pub trait RateLimitAlgorithm: Send + Sync {
    /// Check if an event for `key` should be allowed, consuming quota if so.
    fn is_allowed(&self, key: &str) -> bool;

    /// Get the current state of the limiter for a key without consuming quota.
    fn get_state(&self, key: &str) -> AlgorithmState;

    /// Forget everything recorded for a key.
    fn reset(&self, key: &str) -> bool;

    /// Drop keys with no activity left in the window. Returns how many went.
    fn sweep(&self) -> usize;
}

/// Current state of a rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmState {
    pub requests_in_window: u64,
    pub remaining: u64,
    /// Seconds until the oldest retained event leaves the window.
    pub reset_after_secs: u64,
}
