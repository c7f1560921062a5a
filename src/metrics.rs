//! Prometheus metrics, dependency-injected.
//!
//! A [`Metrics`] handle is constructed once at startup and passed to the
//! components that emit; nothing reads or writes collector state through
//! module-level globals. Rendering for the scrape endpoint goes through
//! the same handle.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::{GatewayError, Result};

const REQUESTS_TOTAL: &str = "gateway_requests_total";
const ERRORS_TOTAL: &str = "gateway_errors_total";
const CACHE_HITS_TOTAL: &str = "gateway_cache_hits_total";
const REQUEST_DURATION: &str = "gateway_request_duration_seconds";
const ACTIVE_REQUESTS: &str = "gateway_active_requests";

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

pub struct Metrics {
    handle: Option<PrometheusHandle>,
}

impl Metrics {
    /// Installs the Prometheus recorder and registers metric metadata.
    ///
    /// Call once per process; a second call fails because the recorder is
    /// already installed.
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.into()), DURATION_BUCKETS)
            .map_err(|e| GatewayError::Internal(format!("metrics buckets: {e}")))?
            .install_recorder()
            .map_err(|e| GatewayError::Internal(format!("metrics recorder: {e}")))?;

        describe_counter!(REQUESTS_TOTAL, "Total requests by upstream, method, and status");
        describe_counter!(ERRORS_TOTAL, "Total gateway errors by upstream and type");
        describe_counter!(CACHE_HITS_TOTAL, "Total response cache hits by upstream");
        describe_histogram!(REQUEST_DURATION, "Request duration in seconds");
        describe_gauge!(ACTIVE_REQUESTS, "Requests currently in flight");

        Ok(Self {
            handle: Some(handle),
        })
    }

    /// A no-op handle for tests: emissions go nowhere and rendering is
    /// empty.
    pub fn disabled() -> Self {
        Self { handle: None }
    }

    /// Renders the current state in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.as_ref().map(PrometheusHandle::render).unwrap_or_default()
    }

    pub fn record_request(&self, service: &str, method: &str, status: u16, duration: Duration) {
        counter!(
            REQUESTS_TOTAL,
            "service" => service.to_owned(),
            "method" => method.to_owned(),
            "status" => status.to_string(),
        )
        .increment(1);
        histogram!(
            REQUEST_DURATION,
            "service" => service.to_owned(),
            "method" => method.to_owned(),
        )
        .record(duration.as_secs_f64());
    }

    pub fn record_error(&self, service: &str, error_type: &str) {
        counter!(
            ERRORS_TOTAL,
            "service" => service.to_owned(),
            "type" => error_type.to_owned(),
        )
        .increment(1);
    }

    pub fn record_cache_hit(&self, service: &str) {
        counter!(CACHE_HITS_TOTAL, "service" => service.to_owned()).increment(1);
    }

    /// Bumps the active-requests gauge, returning a guard that drops it
    /// back down. Tied to a guard so early returns and panics cannot leak
    /// an increment.
    pub fn track_active(&self, service: &str) -> ActiveRequestGuard {
        gauge!(ACTIVE_REQUESTS, "service" => service.to_owned()).increment(1.0);
        ActiveRequestGuard {
            service: service.to_owned(),
        }
    }
}

pub struct ActiveRequestGuard {
    service: String,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        gauge!(ACTIVE_REQUESTS, "service" => self.service.clone()).decrement(1.0);
    }
}
