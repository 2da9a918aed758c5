use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::clock::SharedClock;

/// Number of recent latency samples kept per endpoint
pub const DEFAULT_LATENCY_SAMPLES: usize = 100;

/// Build the `"<METHOD> <path>"` key used to group endpoint statistics
pub fn endpoint_key(method: &str, path: &str) -> String {
    format!("{} {}", method, path)
}

/// Read-only view of a live gauge owned elsewhere
#[derive(Debug, Clone, Default)]
pub struct ConnectionGauge(Arc<AtomicUsize>);

impl ConnectionGauge {
    pub(crate) fn new(inner: Arc<AtomicUsize>) -> Self {
        Self(inner)
    }

    pub fn current(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub avg_response_time: f64,
    pub max_response_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub active_connections: usize,
    pub timestamp: u64,
    pub endpoints: BTreeMap<String, EndpointStats>,
}

#[derive(Debug, Default)]
struct EndpointRecord {
    requests: u64,
    errors: u64,
    latencies: VecDeque<f64>,
}

impl EndpointRecord {
    fn stats(&self) -> EndpointStats {
        let samples = self.latencies.len();
        let (sum, max) = self
            .latencies
            .iter()
            .fold((0.0, 0.0_f64), |(sum, max), t| (sum + t, max.max(*t)));

        EndpointStats {
            request_count: self.requests,
            error_count: self.errors,
            error_rate: if self.requests > 0 {
                self.errors as f64 / self.requests as f64
            } else {
                0.0
            },
            avg_response_time: if samples > 0 { sum / samples as f64 } else { 0.0 },
            max_response_time: max,
        }
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    total_requests: u64,
    endpoints: HashMap<String, EndpointRecord>,
}

/// Per-endpoint request statistics with a bounded latency ring.
///
/// One lock covers the whole table so a snapshot never sees a count without
/// its matching latency sample.
#[derive(Clone)]
pub struct MetricsAggregator {
    state: Arc<Mutex<MetricsState>>,
    clock: SharedClock,
    latency_samples: usize,
    connections: ConnectionGauge,
}

impl MetricsAggregator {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_capacity(clock, DEFAULT_LATENCY_SAMPLES)
    }

    pub fn with_capacity(clock: SharedClock, latency_samples: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MetricsState::default())),
            clock,
            latency_samples: latency_samples.max(1),
            connections: ConnectionGauge::default(),
        }
    }

    /// Report `gauge` as the active connection count in summaries
    pub fn with_connection_gauge(mut self, gauge: ConnectionGauge) -> Self {
        self.connections = gauge;
        self
    }

    pub fn record(&self, endpoint: &str, status: u16, elapsed_secs: f64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.total_requests += 1;

        let record = state.endpoints.entry(endpoint.to_string()).or_default();
        record.requests += 1;
        if status >= 400 {
            record.errors += 1;
        }
        record.latencies.push_back(elapsed_secs.max(0.0));
        while record.latencies.len() > self.latency_samples {
            record.latencies.pop_front();
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let state = self.state.lock();
        MetricsSummary {
            total_requests: state.total_requests,
            active_connections: self.connections.current(),
            timestamp: self.clock.unix_secs(),
            endpoints: state
                .endpoints
                .iter()
                .map(|(key, record)| (key.clone(), record.stats()))
                .collect(),
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.state.lock().total_requests
    }

    pub fn endpoint(&self, endpoint: &str) -> Option<EndpointStats> {
        self.state.lock().endpoints.get(endpoint).map(EndpointRecord::stats)
    }
}
