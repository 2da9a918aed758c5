//! Single entry and exit point the route layer uses for governance.
//!
//! Composes the lockout tracker, rate limiter, metrics aggregator, health
//! runner and connection governor. Constructed once by the server and shared
//! behind an `Arc`; nothing here is a process-wide global.

use rusqlite::Transaction;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::algorithms::DEFAULT_MAX_TRACKED_KEYS;
use crate::clock::SharedClock;
use crate::database::{ConnectionGovernor, WorkerContext};
use crate::error::{Error, Result};
use crate::health::{HealthReport, HealthRunner};
use crate::lockout::{LockoutConfig, LockoutTracker};
use crate::metrics::{MetricsAggregator, MetricsSummary, DEFAULT_LATENCY_SAMPLES};
use crate::rate_limit_config::RateLimitConfig;
use crate::rate_limiter::RateLimiter;

#[derive(Debug, Clone)]
pub struct GovernanceConfig {
    pub rate_limits: RateLimitConfig,
    pub lockout: LockoutConfig,
    pub max_tracked_clients: usize,
    pub latency_samples: usize,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            rate_limits: RateLimitConfig::default(),
            lockout: LockoutConfig::default(),
            max_tracked_clients: DEFAULT_MAX_TRACKED_KEYS,
            latency_samples: DEFAULT_LATENCY_SAMPLES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    LockedOut,
    RateLimited,
}

/// Admission decision for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: None,
            reason: None,
        }
    }

    pub fn deny(reason: DenyReason, retry_after_seconds: u64) -> Self {
        Self {
            allowed: false,
            retry_after_seconds: Some(retry_after_seconds),
            reason: Some(reason),
        }
    }

    /// Turn a denial into the error the HTTP edge renders
    pub fn into_result(self) -> Result<()> {
        let retry_after = self.retry_after_seconds.unwrap_or(0);
        match self.reason {
            _ if self.allowed => Ok(()),
            Some(DenyReason::LockedOut) => Err(Error::Blocked { retry_after }),
            _ => Err(Error::RateLimitExceeded { retry_after }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockoutOutcome {
    pub blocked: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub rate_limit_keys: usize,
    pub lockout_entries: usize,
}

pub struct RequestGovernor {
    rate_limiter: RateLimiter,
    lockout: LockoutTracker,
    metrics: MetricsAggregator,
    health: HealthRunner,
    database: ConnectionGovernor,
}

impl RequestGovernor {
    pub fn new(
        config: GovernanceConfig,
        health: HealthRunner,
        database: ConnectionGovernor,
        clock: SharedClock,
    ) -> Self {
        let metrics = MetricsAggregator::with_capacity(clock.clone(), config.latency_samples)
            .with_connection_gauge(database.gauge());

        Self {
            rate_limiter: RateLimiter::new(
                config.rate_limits,
                clock.clone(),
                config.max_tracked_clients,
            ),
            lockout: LockoutTracker::new(config.lockout, clock),
            metrics,
            health,
            database,
        }
    }

    /// Lockout first, then the policy's quota. A blocked client does not
    /// consume rate limit quota.
    pub fn admit(&self, client_id: &str, policy: &str) -> Decision {
        if let Some(remaining) = self.lockout.blocked_for(client_id) {
            debug!(client = %client_id, policy = %policy, "Request from blocked client denied");
            return Decision::deny(DenyReason::LockedOut, ceil_secs(remaining));
        }

        let decision = self.rate_limiter.check(client_id, policy);
        match decision.retry_after {
            None => Decision::allow(),
            Some(retry_after) => Decision::deny(DenyReason::RateLimited, retry_after),
        }
    }

    pub fn check_lockout(&self, ip: &str) -> bool {
        self.lockout.is_blocked(ip)
    }

    pub fn report_auth_failure(&self, ip: &str) -> LockoutOutcome {
        LockoutOutcome {
            blocked: self.lockout.record_failure(ip),
        }
    }

    pub fn report_auth_success(&self, ip: &str) {
        self.lockout.record_success(ip);
    }

    pub fn record_outcome(&self, endpoint: &str, status: u16, elapsed_secs: f64) {
        self.metrics.record(endpoint, status, elapsed_secs);
    }

    pub fn metrics_summary(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    /// Run every health probe. Blocks for as long as the slowest probe.
    pub fn health(&self) -> HealthReport {
        self.health.run()
    }

    pub fn with_connection<T, F>(&self, ctx: &mut WorkerContext, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        self.database.with_connection(ctx, f)
    }

    pub fn database(&self) -> &ConnectionGovernor {
        &self.database
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn lockout(&self) -> &LockoutTracker {
        &self.lockout
    }

    /// Drop idle clients and expired blocks
    pub fn sweep(&self) -> SweepStats {
        SweepStats {
            rate_limit_keys: self.rate_limiter.sweep(),
            lockout_entries: self.lockout.sweep(),
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration
        .as_secs()
        .saturating_add(u64::from(duration.subsec_nanos() > 0));
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::database::DatabaseConfig;
    use crate::rate_limit_config::{policy, RateLimitRule};
    use std::sync::Arc;

    fn governor(config: GovernanceConfig) -> (Arc<RequestGovernor>, ManualClock) {
        let clock = ManualClock::from_secs(1_000_000);
        let shared: SharedClock = Arc::new(clock.clone());
        let governor = RequestGovernor::new(
            config,
            HealthRunner::new(shared.clone()),
            ConnectionGovernor::new(DatabaseConfig::new(":memory:")),
            shared,
        );
        (Arc::new(governor), clock)
    }

    #[test]
    fn test_admit_denies_over_quota_with_window_hint() {
        let (governor, clock) = governor(GovernanceConfig::default());
        for _ in 0..5 {
            assert!(governor.admit("ip", policy::LOGIN).allowed);
        }

        let denied = governor.admit("ip", policy::LOGIN);
        assert_eq!(denied, Decision::deny(DenyReason::RateLimited, 60));
        assert!(matches!(
            denied.into_result(),
            Err(Error::RateLimitExceeded { retry_after: 60 })
        ));

        clock.advance(Duration::from_secs(61));
        assert!(governor.admit("ip", policy::LOGIN).allowed);
    }

    #[test]
    fn test_blocked_client_short_circuits_before_quota() {
        let (governor, clock) = governor(GovernanceConfig::default());
        for _ in 0..5 {
            governor.report_auth_failure("ip");
        }
        assert!(governor.check_lockout("ip"));

        let denied = governor.admit("ip", policy::INDEX);
        assert_eq!(denied.reason, Some(DenyReason::LockedOut));
        assert_eq!(denied.retry_after_seconds, Some(15 * 60));
        assert_eq!(governor.rate_limiter().tracked_clients(), 0);

        clock.advance(Duration::from_secs(16 * 60));
        assert!(governor.admit("ip", policy::INDEX).allowed);
    }

    #[test]
    fn test_fifth_failure_reports_blocked() {
        let (governor, _) = governor(GovernanceConfig::default());
        let outcomes: Vec<bool> = (0..5)
            .map(|_| governor.report_auth_failure("1.2.3.4").blocked)
            .collect();
        assert_eq!(outcomes, vec![false, false, false, false, true]);
    }

    #[test]
    fn test_concurrent_admits_respect_quota_exactly() {
        let mut config = GovernanceConfig::default();
        config
            .rate_limits
            .set_rule("burst", RateLimitRule::new(7, Duration::from_secs(60)));
        let (governor, _) = governor(config);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let governor = Arc::clone(&governor);
                std::thread::spawn(move || governor.admit("same-client", "burst").allowed)
            })
            .collect();
        let admitted = handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(admitted, 7);
    }

    #[test]
    fn test_metrics_summary_reports_outcomes() {
        let (governor, _) = governor(GovernanceConfig::default());
        governor.record_outcome("GET /users", 200, 0.05);
        governor.record_outcome("GET /users", 500, 0.2);

        let summary = governor.metrics_summary();
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.endpoints["GET /users"].error_rate, 0.5);
        assert_eq!(summary.active_connections, 0);
    }

    #[test]
    fn test_sweep_clears_idle_state() {
        let (governor, clock) = governor(GovernanceConfig::default());
        governor.admit("a", policy::INDEX);
        for _ in 0..5 {
            governor.report_auth_failure("b");
        }

        clock.advance(Duration::from_secs(2 * 60 * 60));
        let stats = governor.sweep();
        assert_eq!(stats.rate_limit_keys, 1);
        assert_eq!(stats.lockout_entries, 2);
    }

    #[test]
    fn test_ceil_secs_rounds_up() {
        assert_eq!(ceil_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
        assert_eq!(ceil_secs(Duration::ZERO), 1);
        assert_eq!(ceil_secs(Duration::MAX), u64::MAX);
    }
}
