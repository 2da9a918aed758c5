use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use validator::Validate;

use crate::error::Error;

/// Named rate limiting policies, one per route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub rules: HashMap<String, RateLimitRule>,
    pub default_rule: RateLimitRule,
}

/// Individual rate limiting rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RateLimitRule {
    #[validate(range(min = 1, message = "max_requests must be greater than 0"))]
    pub max_requests: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub enabled: bool,
}

/// Policy names used by the route layer.
pub mod policy {
    pub const INDEX: &str = "index";
    pub const HEALTH: &str = "health";
    pub const METRICS: &str = "metrics";
    pub const LIST_USERS: &str = "list_users";
    pub const GET_USER: &str = "get_user";
    pub const CREATE_USER: &str = "create_user";
    pub const UPDATE_USER: &str = "update_user";
    pub const DELETE_USER: &str = "delete_user";
    pub const SEARCH: &str = "search";
    pub const LOGIN: &str = "login";
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let per_minute = |max_requests| RateLimitRule::new(max_requests, Duration::from_secs(60));

        let rules = [
            (policy::INDEX, per_minute(200)),
            (policy::HEALTH, per_minute(100)),
            (policy::METRICS, per_minute(100)),
            (policy::LIST_USERS, per_minute(50)),
            (policy::GET_USER, per_minute(100)),
            (policy::CREATE_USER, per_minute(10)),
            (policy::UPDATE_USER, per_minute(20)),
            (policy::DELETE_USER, per_minute(10)),
            (policy::SEARCH, per_minute(30)),
            (policy::LOGIN, per_minute(5)),
        ]
        .into_iter()
        .map(|(name, rule)| (name.to_string(), rule))
        .collect();

        Self {
            rules,
            default_rule: RateLimitRule::default(),
        }
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    /// Config with no named rules, only a default
    pub fn empty(default_rule: RateLimitRule) -> Self {
        Self {
            rules: HashMap::new(),
            default_rule,
        }
    }

    /// Get rate limit rule for a specific policy, falling back to default
    pub fn get_rule(&self, policy: &str) -> &RateLimitRule {
        self.rules.get(policy).unwrap_or(&self.default_rule)
    }

    /// Add or update a rate limit rule
    pub fn set_rule(&mut self, policy: impl Into<String>, rule: RateLimitRule) {
        self.rules.insert(policy.into(), rule);
    }

    /// Remove a rate limit rule
    pub fn remove_rule(&mut self, policy: &str) -> Option<RateLimitRule> {
        self.rules.remove(policy)
    }

    /// Validate every enabled rule, naming the offending policy on failure
    pub fn validate(&self) -> Result<(), Error> {
        let named = self.rules.iter().map(|(name, rule)| (name.as_str(), rule));
        for (name, rule) in std::iter::once(("default", &self.default_rule)).chain(named) {
            if !rule.enabled {
                continue;
            }
            rule.validate().map_err(|e| {
                Error::Configuration(format!("rate limit policy '{}': {}", name, e))
            })?;
            if rule.window.as_secs() == 0 {
                return Err(Error::Configuration(format!(
                    "rate limit policy '{}': window must be at least one second",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl RateLimitRule {
    /// Create a new rate limit rule
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            enabled: true,
        }
    }

    /// Create a disabled rule
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window.as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policies_cover_routes() {
        let config = RateLimitConfig::default();
        assert_eq!(config.get_rule(policy::LOGIN).max_requests, 5);
        assert_eq!(config.get_rule(policy::INDEX).max_requests, 200);
        assert_eq!(config.get_rule(policy::CREATE_USER).window_secs(), 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_policy_uses_default_rule() {
        let config = RateLimitConfig::default();
        assert_eq!(config.get_rule("nope"), &RateLimitRule::default());
    }

    #[test]
    fn test_invalid_rules_are_rejected() {
        let mut config = RateLimitConfig::default();
        config.set_rule("broken", RateLimitRule::new(0, Duration::from_secs(60)));
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("broken"));

        let mut config = RateLimitConfig::default();
        config.set_rule("instant", RateLimitRule::new(5, Duration::ZERO));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_rules_skip_validation() {
        let mut config = RateLimitConfig::default();
        config.set_rule(
            "off",
            RateLimitRule {
                max_requests: 0,
                ..RateLimitRule::disabled()
            },
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rule_window_serializes_human_readable() {
        let rule = RateLimitRule::new(10, Duration::from_secs(90));
        let json = serde_json::to_value(rule).unwrap();
        assert_eq!(json["window"], "1m 30s");

        let back: RateLimitRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }
}
