//! Sliding window rate limiting algorithm
//!
//! Keeps a log of event timestamps per key and admits a new event only while
//! fewer than `max_events` remain inside the trailing window. Rejected events
//! are not logged, so a denied caller does not push its own recovery further
//! away.

use super::{AlgorithmConfig, AlgorithmState, RateLimitAlgorithm};
use crate::clock::SharedClock;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

type EventLog = VecDeque<Duration>;

/// Sliding window event counter keyed by client identity.
///
/// All keys live behind one mutex: observe-then-append is atomic for a key,
/// and each call is short enough that cross-key contention stays low.
pub struct SlidingWindowCounter {
    config: AlgorithmConfig,
    clock: SharedClock,
    logs: Mutex<HashMap<String, EventLog>>,
}

impl SlidingWindowCounter {
    /// Create a new sliding window counter
    pub fn new(config: AlgorithmConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_limits(max_events: u32, window: Duration, clock: SharedClock) -> Self {
        Self::new(AlgorithmConfig::new(max_events, window), clock)
    }

    pub fn config(&self) -> &AlgorithmConfig {
        &self.config
    }

    pub fn window(&self) -> Duration {
        self.config.window
    }

    pub fn max_events(&self) -> u32 {
        self.config.max_events
    }

    /// Record an event for `key` at the clock's current time.
    pub fn record(&self, key: &str) -> bool {
        self.record_at(key, self.clock.now())
    }

    /// Record an event for `key` at an explicit time.
    pub fn record_at(&self, key: &str, now: Duration) -> bool {
        self.record_counted(key, now).0
    }

    /// Record an event and also report how many events the window holds
    /// afterwards, observed under the same lock.
    pub(crate) fn record_counted(&self, key: &str, now: Duration) -> (bool, usize) {
        let mut logs = self.logs.lock();

        if !logs.contains_key(key) {
            self.make_room(&mut logs, now);
        }

        let log = logs.entry(key.to_owned()).or_default();
        prune(log, now, self.config.window);

        if log.len() < self.config.max_events as usize {
            // keep insertion order non-decreasing even if the clock steps back
            let at = log.back().map_or(now, |last| now.max(*last));
            log.push_back(at);
            (true, log.len())
        } else {
            (false, log.len())
        }
    }

    /// Number of events inside the window for `key`.
    pub fn count(&self, key: &str) -> usize {
        let now = self.clock.now();
        let mut logs = self.logs.lock();
        match logs.get_mut(key) {
            Some(log) => {
                prune(log, now, self.config.window);
                log.len()
            }
            None => 0,
        }
    }

    pub fn state(&self, key: &str) -> AlgorithmState {
        let now = self.clock.now();
        let mut logs = self.logs.lock();

        let (in_window, oldest) = match logs.get_mut(key) {
            Some(log) => {
                prune(log, now, self.config.window);
                (log.len() as u64, log.front().copied())
            }
            None => (0, None),
        };

        let reset_after_secs = oldest
            .map(|oldest| {
                oldest
                    .saturating_add(self.config.window)
                    .saturating_sub(now)
                    .as_secs()
            })
            .unwrap_or(0);

        AlgorithmState {
            requests_in_window: in_window,
            remaining: u64::from(self.config.max_events).saturating_sub(in_window),
            reset_after_secs,
        }
    }

    pub fn reset(&self, key: &str) -> bool {
        self.logs.lock().remove(key).is_some()
    }

    /// Remove every key matching `predicate`. Returns how many went.
    pub fn reset_where(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut logs = self.logs.lock();
        let before = logs.len();
        logs.retain(|key, _| !predicate(key));
        before - logs.len()
    }

    /// Remove keys whose logs are empty once pruned.
    pub fn sweep(&self) -> usize {
        self.sweep_at(self.clock.now())
    }

    pub fn sweep_at(&self, now: Duration) -> usize {
        let mut logs = self.logs.lock();
        let before = logs.len();
        let window = self.config.window;
        logs.retain(|_, log| {
            prune(log, now, window);
            !log.is_empty()
        });
        before - logs.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.logs.lock().len()
    }

    /// Keep the key count under `max_tracked_keys` before a new key goes in.
    fn make_room(&self, logs: &mut HashMap<String, EventLog>, now: Duration) {
        if logs.len() < self.config.max_tracked_keys {
            return;
        }

        let window = self.config.window;
        logs.retain(|_, log| {
            prune(log, now, window);
            !log.is_empty()
        });
        if logs.len() < self.config.max_tracked_keys {
            return;
        }

        let stalest = logs
            .iter()
            .min_by_key(|(_, log)| log.back().copied())
            .map(|(key, _)| key.clone());
        if let Some(key) = stalest {
            debug!(key = %key, "Tracked key cap reached, evicting least recently active key");
            logs.remove(&key);
        }
    }
}

impl RateLimitAlgorithm for SlidingWindowCounter {
    fn is_allowed(&self, key: &str) -> bool {
        self.record(key)
    }

    fn get_state(&self, key: &str) -> AlgorithmState {
        self.state(key)
    }

    fn reset(&self, key: &str) -> bool {
        SlidingWindowCounter::reset(self, key)
    }

    fn sweep(&self) -> usize {
        SlidingWindowCounter::sweep(self)
    }
}

/// Drop entries older than `now - window`.
fn prune(log: &mut EventLog, now: Duration, window: Duration) {
    let cutoff = now.saturating_sub(window);
    while log.front().is_some_and(|t| *t < cutoff) {
        log.pop_front();
    }
}
