use envconfig::Envconfig;
use std::net::SocketAddr;
use std::time::Duration;

use crate::database::{DatabaseConfig, SlotPolicy};
use crate::governance::GovernanceConfig;
use crate::lockout::LockoutConfig;
use crate::rate_limit_config::RateLimitConfig;

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// SQLite database file
    #[envconfig(from = "DATABASE_PATH", default = "users.db")]
    pub database_path: String,

    /// Ceiling on live database handles
    #[envconfig(from = "MAX_CONNECTIONS", default = "10")]
    pub max_connections: usize,

    /// `best_effort` or `strict`
    #[envconfig(from = "SLOT_POLICY", default = "best_effort")]
    pub slot_policy: SlotPolicy,

    /// Backoff attempts when the connection ceiling is reached
    #[envconfig(from = "CONNECTION_RETRIES", default = "3")]
    pub connection_retries: u32,

    #[envconfig(from = "DATABASE_BUSY_TIMEOUT_SECS", default = "30")]
    pub busy_timeout_secs: u64,

    /// Failed logins before a client is blocked
    #[envconfig(from = "LOCKOUT_MAX_ATTEMPTS", default = "5")]
    pub lockout_max_attempts: u32,

    #[envconfig(from = "LOCKOUT_DURATION_SECS", default = "900")]
    pub lockout_duration_secs: u64,

    #[envconfig(from = "LOCKOUT_LOOKBACK_SECS", default = "3600")]
    pub lockout_lookback_secs: u64,

    /// Clear the failure log after a successful login
    #[envconfig(from = "LOCKOUT_RESET_ON_SUCCESS", default = "false")]
    pub lockout_reset_on_success: bool,

    /// Idle client sweep interval in seconds
    #[envconfig(from = "CLEANUP_INTERVAL", default = "300")]
    pub cleanup_interval_secs: u64,

    /// Cap on distinct clients tracked per counter
    #[envconfig(from = "MAX_TRACKED_CLIENTS", default = "100000")]
    pub max_tracked_clients: usize,

    #[envconfig(from = "HEALTH_TIMEOUT_SECS", default = "5")]
    pub health_timeout_secs: u64,

    /// Memory usage percentage above which the memory probe fails
    #[envconfig(from = "MEMORY_THRESHOLD", default = "90")]
    pub memory_threshold: f64,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Honour X-Forwarded-For / X-Real-IP when identifying clients
    #[envconfig(from = "TRUST_PROXY_HEADERS", default = "false")]
    pub trust_proxy_headers: bool,

    #[envconfig(from = "MAX_BODY_BYTES", default = "16777216")]
    pub max_body_bytes: usize,

    /// Comma separated origins, or `*`
    #[envconfig(from = "CORS_ORIGINS", default = "*")]
    pub cors_origins: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn database(&self) -> DatabaseConfig {
        DatabaseConfig {
            path: self.database_path.clone(),
            max_connections: self.max_connections,
            busy_timeout: Duration::from_secs(self.busy_timeout_secs),
            max_retries: self.connection_retries,
            slot_policy: self.slot_policy,
            ..DatabaseConfig::default()
        }
    }

    pub fn lockout(&self) -> LockoutConfig {
        LockoutConfig {
            max_attempts: self.lockout_max_attempts,
            lockout_duration: Duration::from_secs(self.lockout_duration_secs),
            lookback: Duration::from_secs(self.lockout_lookback_secs),
            reset_on_success: self.lockout_reset_on_success,
            max_tracked_keys: self.max_tracked_clients,
        }
    }

    pub fn governance(&self) -> GovernanceConfig {
        GovernanceConfig {
            rate_limits: RateLimitConfig::default(),
            lockout: self.lockout(),
            max_tracked_clients: self.max_tracked_clients,
            ..GovernanceConfig::default()
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    /// Parsed CORS origins; `None` means any origin
    pub fn allowed_origins(&self) -> Option<Vec<String>> {
        let origins: Vec<String> = self
            .cors_origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();

        if origins.is_empty() || origins.iter().any(|o| o == "*") {
            None
        } else {
            Some(origins)
        }
    }
}
