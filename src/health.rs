use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use sysinfo::System;
use thiserror::Error;
use tracing::warn;

use crate::clock::SharedClock;
use crate::database::ConnectionGovernor;

/// Failure reported by a health probe
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ProbeError(pub String);

impl ProbeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A stateless observation of one dependency.
///
/// Probes must not mutate governed state. They run synchronously and are not
/// bounded by any timeout here; callers that need a deadline impose one.
pub trait HealthProbe: Send + Sync {
    fn check(&self) -> Result<Value, ProbeError>;
}

impl<F> HealthProbe for F
where
    F: Fn() -> Result<Value, ProbeError> + Send + Sync,
{
    fn check(&self) -> Result<Value, ProbeError> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub timestamp: u64,
    pub checks: BTreeMap<String, CheckResult>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// Registry of named probes, filled at startup and read-only afterwards
pub struct HealthRunner {
    clock: SharedClock,
    probes: Vec<(String, Box<dyn HealthProbe>)>,
}

impl HealthRunner {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            probes: Vec::new(),
        }
    }

    /// Register a closure probe.
    pub fn register<F>(&mut self, name: impl Into<String>, probe: F)
    where
        F: Fn() -> Result<Value, ProbeError> + Send + Sync + 'static,
    {
        self.register_probe(name, probe);
    }

    /// Register a probe. Re-registering a name replaces the earlier probe.
    pub fn register_probe(&mut self, name: impl Into<String>, probe: impl HealthProbe + 'static) {
        let name = name.into();
        self.probes.retain(|(existing, _)| *existing != name);
        self.probes.push((name, Box::new(probe)));
    }

    pub fn probe_names(&self) -> impl Iterator<Item = &str> {
        self.probes.iter().map(|(name, _)| name.as_str())
    }

    /// Run every probe in registration order.
    pub fn run(&self) -> HealthReport {
        let mut status = HealthState::Healthy;
        let mut checks = BTreeMap::new();

        for (name, probe) in &self.probes {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| probe.check()))
                .unwrap_or_else(|_| Err(ProbeError::new("health probe panicked")));

            let result = match outcome {
                Ok(details) => CheckResult {
                    status: HealthState::Healthy,
                    details: Some(details),
                    error: None,
                },
                Err(err) => {
                    warn!(check = %name, error = %err, "Health check failed");
                    status = HealthState::Unhealthy;
                    CheckResult {
                        status: HealthState::Unhealthy,
                        details: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            checks.insert(name.clone(), result);
        }

        HealthReport {
            status,
            timestamp: self.clock.unix_secs(),
            checks,
        }
    }
}

/// Probe that runs `SELECT 1` through the connection governor
pub fn database_probe(governor: ConnectionGovernor) -> impl HealthProbe {
    move || {
        governor
            .with_thread_connection(|tx| {
                let one: i64 = tx.query_row("SELECT 1", [], |row| row.get(0))?;
                Ok(one)
            })
            .map(|_| json!({ "connection": "ok" }))
            .map_err(|e| ProbeError::new(format!("Database connection failed: {}", e)))
    }
}

/// Probe that fails once system memory use exceeds `threshold_percent`
pub fn memory_probe(threshold_percent: f64) -> impl HealthProbe {
    move || {
        let mut system = System::new();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Err(ProbeError::new("Memory statistics unavailable"));
        }
        let percent = system.used_memory() as f64 / total as f64 * 100.0;
        let percent = (percent * 10.0).round() / 10.0;

        if percent > threshold_percent {
            return Err(ProbeError::new(format!("High memory usage: {}%", percent)));
        }
        Ok(json!({ "memory_percent": percent }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn runner() -> HealthRunner {
        HealthRunner::new(Arc::new(ManualClock::from_secs(42)))
    }

    #[test]
    fn test_all_probes_healthy() {
        let mut runner = runner();
        runner.register("a", || Ok(json!({ "ok": true })));
        runner.register("b", || Ok(Value::Null));

        let report = runner.run();
        assert!(report.is_healthy());
        assert_eq!(report.timestamp, 42);
        assert_eq!(report.checks["a"].details, Some(json!({ "ok": true })));
    }

    #[test]
    fn test_failing_probe_flips_status_but_others_still_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let mut runner = runner();
        runner.register("broken", || Err(ProbeError::new("unreachable")));
        runner.register("counted", move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(json!({}))
        });

        let report = runner.run();
        assert_eq!(report.status, HealthState::Unhealthy);
        assert_eq!(report.checks["broken"].error.as_deref(), Some("unreachable"));
        assert_eq!(report.checks["counted"].status, HealthState::Healthy);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_probe_is_reported_unhealthy() {
        let mut runner = runner();
        runner.register("boom", || -> Result<Value, ProbeError> { panic!("probe exploded") });

        let report = runner.run();
        assert!(!report.is_healthy());
        assert!(report.checks["boom"].error.is_some());
    }

    #[test]
    fn test_empty_registry_is_healthy() {
        assert!(runner().run().is_healthy());
    }

    #[test]
    fn test_report_serialization() {
        let mut runner = runner();
        runner.register("db", || Err(ProbeError::new("down")));

        let json = serde_json::to_value(runner.run()).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["checks"]["db"]["status"], "unhealthy");
        assert_eq!(json["checks"]["db"]["error"], "down");
        assert!(json["checks"]["db"].get("details").is_none());
    }

    #[test]
    fn test_memory_probe_threshold() {
        assert!(memory_probe(100.0).check().is_ok());
        assert!(memory_probe(-1.0).check().is_err());
    }
}
