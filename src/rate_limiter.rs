use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::algorithms::{AlgorithmConfig, RateLimitAlgorithm, SlidingWindowCounter};
use crate::clock::SharedClock;
use crate::rate_limit_config::{RateLimitConfig, RateLimitRule};

/// Outcome of a rate limit check for one client under one policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: u64::MAX,
            retry_after: None,
        }
    }
}

/// Per-client admission control over named policies.
///
/// Every policy owns its own sliding window counter, so a client's quota on
/// one route never leaks into another even when the numbers match.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    max_tracked_keys: usize,
    policies: HashMap<String, Arc<SlidingWindowCounter>>,
    fallback: Arc<SlidingWindowCounter>,
    ad_hoc: Mutex<HashMap<(u32, Duration), Arc<SlidingWindowCounter>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: SharedClock, max_tracked_keys: usize) -> Self {
        let counter_for = |rule: &RateLimitRule| {
            let algorithm = AlgorithmConfig::new(rule.max_requests, rule.window)
                .with_max_tracked_keys(max_tracked_keys);
            Arc::new(SlidingWindowCounter::new(algorithm, clock.clone()))
        };

        let policies = config
            .rules
            .iter()
            .map(|(name, rule)| (name.clone(), counter_for(rule)))
            .collect();
        let fallback = counter_for(&config.default_rule);

        Self {
            config,
            clock,
            max_tracked_keys,
            policies,
            fallback,
            ad_hoc: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check `client_id` against the named policy, consuming quota if allowed
    pub fn check(&self, client_id: &str, policy: &str) -> RateLimitDecision {
        let rule = self.config.get_rule(policy);
        if !rule.enabled {
            return RateLimitDecision::unlimited();
        }

        let (counter, key) = match self.policies.get(policy) {
            Some(counter) => (counter, client_id.to_string()),
            None => (&self.fallback, format!("{}:{}", policy, client_id)),
        };

        let (allowed, in_window) = counter.record_counted(&key, self.clock.now());
        let remaining = u64::from(rule.max_requests).saturating_sub(in_window as u64);

        if allowed {
            RateLimitDecision {
                allowed,
                limit: rule.max_requests,
                remaining,
                retry_after: None,
            }
        } else {
            debug!(
                client = %client_id,
                policy = %policy,
                limit = rule.max_requests,
                "Rate limit exceeded"
            );
            RateLimitDecision {
                allowed,
                limit: rule.max_requests,
                remaining: 0,
                retry_after: Some(rule.window_secs()),
            }
        }
    }

    /// Check with explicit parameters; each distinct `(max_requests, window)`
    /// pair gets its own counter
    pub fn is_allowed(&self, client_id: &str, max_requests: u32, window: Duration) -> bool {
        let counter = {
            let mut ad_hoc = self.ad_hoc.lock();
            ad_hoc
                .entry((max_requests, window))
                .or_insert_with(|| {
                    let algorithm = AlgorithmConfig::new(max_requests, window)
                        .with_max_tracked_keys(self.max_tracked_keys);
                    Arc::new(SlidingWindowCounter::new(algorithm, self.clock.clone()))
                })
                .clone()
        };
        counter.is_allowed(client_id)
    }

    /// Reset rate limit for a client across every policy
    pub fn reset(&self, client_id: &str) {
        for counter in self.policies.values() {
            counter.reset(client_id);
        }
        self.fallback.reset_where(|key| {
            key.split_once(':')
                .is_some_and(|(_, client)| client == client_id)
        });
        for counter in self.ad_hoc.lock().values() {
            counter.reset(client_id);
        }
    }

    /// Drop idle clients from every counter
    pub fn sweep(&self) -> usize {
        let ad_hoc: Vec<_> = self.ad_hoc.lock().values().cloned().collect();
        self.policies
            .values()
            .chain(std::iter::once(&self.fallback))
            .chain(ad_hoc.iter())
            .map(|counter| counter.sweep())
            .sum()
    }

    /// Number of client keys currently tracked across all counters
    pub fn tracked_clients(&self) -> usize {
        let ad_hoc: usize = self.ad_hoc.lock().values().map(|c| c.tracked_keys()).sum();
        self.policies
            .values()
            .map(|c| c.tracked_keys())
            .sum::<usize>()
            + self.fallback.tracked_keys()
            + ad_hoc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::DEFAULT_MAX_TRACKED_KEYS;
    use crate::clock::ManualClock;
    use crate::rate_limit_config::policy;

    fn limiter(config: RateLimitConfig) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::from_secs(1_000);
        let limiter = RateLimiter::new(config, Arc::new(clock.clone()), DEFAULT_MAX_TRACKED_KEYS);
        (limiter, clock)
    }

    #[test]
    fn test_denial_carries_window_as_retry_hint() {
        let (limiter, _) = limiter(RateLimitConfig::default());

        for _ in 0..5 {
            assert!(limiter.check("10.0.0.1", policy::LOGIN).allowed);
        }
        let denied = limiter.check("10.0.0.1", policy::LOGIN);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(60));
        assert_eq!(denied.limit, 5);
    }

    #[test]
    fn test_policies_are_independent() {
        let mut config = RateLimitConfig::empty(RateLimitRule::default());
        config.set_rule("a", RateLimitRule::new(1, Duration::from_secs(60)));
        config.set_rule("b", RateLimitRule::new(1, Duration::from_secs(60)));
        let (limiter, _) = limiter(config);

        assert!(limiter.check("c", "a").allowed);
        assert!(!limiter.check("c", "a").allowed);
        assert!(limiter.check("c", "b").allowed);
    }

    #[test]
    fn test_unknown_policies_do_not_share_quota() {
        let config = RateLimitConfig::empty(RateLimitRule::new(1, Duration::from_secs(60)));
        let (limiter, _) = limiter(config);

        assert!(limiter.check("c", "x").allowed);
        assert!(!limiter.check("c", "x").allowed);
        assert!(limiter.check("c", "y").allowed);
    }

    #[test]
    fn test_disabled_policy_always_allows() {
        let mut config = RateLimitConfig::default();
        config.set_rule("open", RateLimitRule::disabled());
        let (limiter, _) = limiter(config);

        for _ in 0..1_000 {
            assert!(limiter.check("c", "open").allowed);
        }
    }

    #[test]
    fn test_remaining_counts_down() {
        let (limiter, _) = limiter(RateLimitConfig::default());
        assert_eq!(limiter.check("c", policy::LOGIN).remaining, 4);
        assert_eq!(limiter.check("c", policy::LOGIN).remaining, 3);
    }

    #[test]
    fn test_ad_hoc_configurations_are_separate() {
        let (limiter, clock) = limiter(RateLimitConfig::default());
        let minute = Duration::from_secs(60);

        assert!(limiter.is_allowed("c", 1, minute));
        assert!(!limiter.is_allowed("c", 1, minute));
        assert!(limiter.is_allowed("c", 2, minute));

        clock.advance(Duration::from_secs(61));
        assert!(limiter.is_allowed("c", 1, minute));
    }

    #[test]
    fn test_reset_and_sweep() {
        let (limiter, clock) = limiter(RateLimitConfig::default());
        for _ in 0..5 {
            limiter.check("c", policy::LOGIN);
        }
        limiter.check("c", "custom");
        limiter.reset("c");
        assert!(limiter.check("c", policy::LOGIN).allowed);
        assert_eq!(limiter.tracked_clients(), 1);

        clock.advance(Duration::from_secs(120));
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_clients(), 0);
    }
}
