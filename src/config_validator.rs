use crate::config::Config;
use crate::error::Error;
use crate::rate_limit_config::RateLimitConfig;

/// Upper bound for LOCKOUT_DURATION_SECS and LOCKOUT_LOOKBACK_SECS (30 days)
pub const MAX_LOCKOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates everything the server needs before it starts
    pub fn validate(config: &Config) -> Result<(), Error> {
        Self::validate_database_path(&config.database_path)?;
        Self::validate_connection_limits(config.max_connections, config.connection_retries)?;
        Self::validate_lockout(
            config.lockout_max_attempts,
            config.lockout_duration_secs,
            config.lockout_lookback_secs,
        )?;
        Self::validate_positive("CLEANUP_INTERVAL", config.cleanup_interval_secs)?;
        Self::validate_positive("HEALTH_TIMEOUT_SECS", config.health_timeout_secs)?;
        Self::validate_positive("MAX_TRACKED_CLIENTS", config.max_tracked_clients as u64)?;
        Self::validate_positive("MAX_BODY_BYTES", config.max_body_bytes as u64)?;
        Self::validate_memory_threshold(config.memory_threshold)?;
        Self::validate_log_level(&config.log_level)?;
        Self::validate_rate_limits(&config.governance().rate_limits)?;
        Ok(())
    }

    pub fn validate_database_path(path: &str) -> Result<(), Error> {
        if path.trim().is_empty() {
            return Err(Error::Configuration(
                "Database path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_connection_limits(max_connections: usize, retries: u32) -> Result<(), Error> {
        if max_connections == 0 {
            return Err(Error::Configuration(
                "MAX_CONNECTIONS must be greater than 0".to_string(),
            ));
        }

        if retries > 10 {
            return Err(Error::Configuration(
                "CONNECTION_RETRIES must be at most 10".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_lockout(
        max_attempts: u32,
        duration_secs: u64,
        lookback_secs: u64,
    ) -> Result<(), Error> {
        if max_attempts == 0 {
            return Err(Error::Configuration(
                "LOCKOUT_MAX_ATTEMPTS must be greater than 0".to_string(),
            ));
        }

        if duration_secs == 0 || lookback_secs == 0 {
            return Err(Error::Configuration(
                "Lockout duration and lookback must be greater than 0".to_string(),
            ));
        }

        if duration_secs > MAX_LOCKOUT_SECS || lookback_secs > MAX_LOCKOUT_SECS {
            return Err(Error::Configuration(format!(
                "Lockout duration and lookback must not exceed {} seconds",
                MAX_LOCKOUT_SECS
            )));
        }

        Ok(())
    }

    pub fn validate_memory_threshold(percent: f64) -> Result<(), Error> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(Error::Configuration(format!(
                "MEMORY_THRESHOLD must be between 0 and 100, got {}",
                percent
            )));
        }

        Ok(())
    }

    pub fn validate_log_level(level: &str) -> Result<(), Error> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&level.to_lowercase().as_str()) {
            return Err(Error::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {:?}",
                level, valid_levels
            )));
        }

        Ok(())
    }

    pub fn validate_rate_limits(config: &RateLimitConfig) -> Result<(), Error> {
        config.validate()
    }

    fn validate_positive(name: &str, value: u64) -> Result<(), Error> {
        if value == 0 {
            return Err(Error::Configuration(format!(
                "{} must be greater than 0",
                name
            )));
        }

        Ok(())
    }
}
