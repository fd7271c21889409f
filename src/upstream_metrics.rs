//! Prometheus metrics for upstream fetches

use prometheus::{CounterVec, HistogramVec, Registry};
use std::sync::Arc;

/// Per-backend metrics for upstream requests
#[derive(Clone)]
pub struct UpstreamMetrics {
    /// Requests sent upstream
    pub requests_total: Arc<CounterVec>,

    /// Responses by backend and status class
    pub responses_total: Arc<CounterVec>,

    /// Connection-level failures
    pub errors_total: Arc<CounterVec>,

    /// Body bytes received
    pub bytes_total: Arc<CounterVec>,

    /// Time until the response header arrived
    pub header_latency_seconds: Arc<HistogramVec>,
}

impl UpstreamMetrics {
    /// Create metrics registered with `registry`
    pub fn with_registry(registry: &Registry) -> Result<Self, prometheus::Error> {
        let requests_total = CounterVec::new(
            prometheus::Opts::new(
                "pkg_relay_upstream_requests_total",
                "Total number of requests sent to upstream backends",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let responses_total = CounterVec::new(
            prometheus::Opts::new(
                "pkg_relay_upstream_responses_total",
                "Total number of upstream responses by status class",
            ),
            &["backend", "class"], // class: 2xx, 3xx, 4xx, 5xx
        )?;
        registry.register(Box::new(responses_total.clone()))?;

        let errors_total = CounterVec::new(
            prometheus::Opts::new(
                "pkg_relay_upstream_errors_total",
                "Total number of upstream connection errors",
            ),
            &["backend", "kind"], // kind: connect, timeout, protocol, lost
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let bytes_total = CounterVec::new(
            prometheus::Opts::new(
                "pkg_relay_upstream_bytes_total",
                "Total number of body bytes received from upstream",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(bytes_total.clone()))?;

        let header_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "pkg_relay_upstream_header_latency_seconds",
                "Time from sending a request until its response header arrived",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["backend"],
        )?;
        registry.register(Box::new(header_latency_seconds.clone()))?;

        Ok(Self {
            requests_total: Arc::new(requests_total),
            responses_total: Arc::new(responses_total),
            errors_total: Arc::new(errors_total),
            bytes_total: Arc::new(bytes_total),
            header_latency_seconds: Arc::new(header_latency_seconds),
        })
    }

    /// Record a request written to `backend`
    pub fn record_request(&self, backend: &str) {
        self.requests_total.with_label_values(&[backend]).inc();
    }

    /// Record a response header
    pub fn record_response(&self, backend: &str, status: u16, latency_secs: f64) {
        let class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        self.responses_total
            .with_label_values(&[backend, class])
            .inc();
        self.header_latency_seconds
            .with_label_values(&[backend])
            .observe(latency_secs);
    }

    /// Record a connection-level failure
    pub fn record_error(&self, backend: &str, kind: &str) {
        self.errors_total.with_label_values(&[backend, kind]).inc();
    }

    pub fn record_bytes(&self, backend: &str, bytes: u64) {
        self.bytes_total
            .with_label_values(&[backend])
            .inc_by(bytes as f64);
    }
}
