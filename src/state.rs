//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every relay actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership (every actix worker and every session holds a reference)
//! - **RwLock**: Multiple readers OR one writer at a time
//! - **Result**: Thread-safe shared mutable state without data races
//!
//! ### Cheap clones
//! `AppState` only contains `Arc`s and handles, so cloning it into each
//! WebSocket actor copies pointers, not data.

use crate::config::AppConfig;
use crate::relay::probe::Prober;
use crate::relay::registry::SessionRegistry;
use crate::relay::session::FrameCounters;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state that's shared across all request handlers.
///
/// ## Fields:
/// - `config`: Loaded once at startup, read by every new session
/// - `metrics`: HTTP and relay counters, updated by middleware and by sessions on close
/// - `sessions`: Registry of live relay sessions (the only state the core shares)
/// - `prober`: Reachability checker, shared so its HTTP client is built once
/// - `start_time`: When the server started, for uptime reporting
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub sessions: SessionRegistry,
    pub prober: Prober,
    pub start_time: Instant,
}

/// Counters collected across HTTP requests and relay sessions.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of HTTP errors (4xx/5xx) since server start
    pub error_count: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    /// Relay counters, summed over finished sessions
    pub relay: RelayMetrics,
}

#[derive(Debug, Default, Clone)]
pub struct RelayMetrics {
    pub sessions_completed: u64,
    pub probe_failures: u64,
    pub connect_failures: u64,
    pub frames_client_to_upstream: u64,
    pub frames_upstream_to_client: u64,
    pub frames_dropped: u64,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create the shared state. Fails only if the probe HTTP client cannot be built.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let prober = Prober::new(config.upstream.probe_url.clone(), config.probe_timeout())?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            sessions: SessionRegistry::new(),
            prober,
            start_time: Instant::now(),
        })
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn with_metrics(&self, update: impl FnOnce(&mut AppMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }

    pub fn increment_request_count(&self) {
        self.with_metrics(|m| m.request_count += 1);
    }

    pub fn increment_error_count(&self) {
        self.with_metrics(|m| m.error_count += 1);
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.with_metrics(|metrics| {
            let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
            endpoint_metric.request_count += 1;
            endpoint_metric.total_duration_ms += duration_ms;
            if is_error {
                endpoint_metric.error_count += 1;
            }
        });
    }

    pub fn record_probe_failure(&self) {
        self.with_metrics(|m| m.relay.probe_failures += 1);
    }

    pub fn record_connect_failure(&self) {
        self.with_metrics(|m| m.relay.connect_failures += 1);
    }

    /// Fold a finished session's frame counters into the totals.
    pub fn record_session_end(&self, counters: &FrameCounters) {
        self.with_metrics(|m| {
            m.relay.sessions_completed += 1;
            m.relay.frames_client_to_upstream += counters.client_to_upstream;
            m.relay.frames_upstream_to_client += counters.upstream_to_client;
            m.relay.frames_dropped += counters.dropped;
        });
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        let mut config = AppConfig::default();
        config.upstream.api_key = "test-key".to_string();
        AppState::new(config).unwrap()
    }

    #[test]
    fn test_session_end_accumulates_counters() {
        let state = state();
        let counters = FrameCounters {
            client_to_upstream: 3,
            upstream_to_client: 1,
            dropped: 2,
        };
        state.record_session_end(&counters);
        state.record_session_end(&counters);
        state.record_probe_failure();

        let relay = state.get_metrics_snapshot().relay;
        assert_eq!(relay.sessions_completed, 2);
        assert_eq!(relay.frames_client_to_upstream, 6);
        assert_eq!(relay.frames_upstream_to_client, 2);
        assert_eq!(relay.frames_dropped, 4);
        assert_eq!(relay.probe_failures, 1);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }
}
