//! Metrics collection for the caching proxy
//!
//! This module provides thread-safe metrics collection using atomic operations.
//! It tracks client requests, cache hits/misses, downloads and byte counts.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collector for the proxy
///
/// All operations are thread-safe using atomic operations.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    // Client statistics
    total_requests: AtomicU64,
    head_requests: AtomicU64,
    rejected_requests: AtomicU64,
    client_disconnects: AtomicU64,
    active_connections: AtomicU64,

    // Cache statistics
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    // Download statistics
    downloads_started: AtomicU64,
    downloads_completed: AtomicU64,
    downloads_failed: AtomicU64,
    redirects: AtomicU64,
    failovers: AtomicU64,
    resume_restarts: AtomicU64,
    pipeline_collisions: AtomicU64,

    // Byte statistics
    bytes_from_upstream: AtomicU64,
    bytes_to_client: AtomicU64,

    // Latency statistics (stored as microseconds)
    total_request_duration_us: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub head_requests: u64,
    pub rejected_requests: u64,
    pub client_disconnects: u64,
    pub active_connections: u64,

    pub cache_hits: u64,
    pub cache_misses: u64,

    pub downloads_started: u64,
    pub downloads_completed: u64,
    pub downloads_failed: u64,
    pub redirects: u64,
    pub failovers: u64,
    pub resume_restarts: u64,
    pub pipeline_collisions: u64,

    pub bytes_from_upstream: u64,
    pub bytes_to_client: u64,

    pub total_request_duration_us: u64,
}

impl ProxyMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a parsed client request
    pub fn record_request(&self, head: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if head {
            self.head_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a request answered with a 4xx before touching the cache
    pub fn record_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_client_disconnect(&self) {
        self.client_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_started(&self) {
        self.downloads_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a download
    ///
    /// # Arguments
    /// * `success` - Whether the entry ended up complete
    pub fn record_download_finished(&self, success: bool) {
        if success {
            self.downloads_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.downloads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_redirect(&self) {
        self.redirects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resume_restart(&self) {
        self.resume_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pipeline_collision(&self) {
        self.pipeline_collisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_from_upstream(&self, bytes: u64) {
        self.bytes_from_upstream.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_to_client(&self, bytes: u64) {
        self.bytes_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record the time spent serving one client request
    pub fn record_request_duration(&self, duration: Duration) {
        self.total_request_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Fields are read independently, so the snapshot may not be perfectly
    /// consistent across all of them.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            head_requests: self.head_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            client_disconnects: self.client_disconnects.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            downloads_started: self.downloads_started.load(Ordering::Relaxed),
            downloads_completed: self.downloads_completed.load(Ordering::Relaxed),
            downloads_failed: self.downloads_failed.load(Ordering::Relaxed),
            redirects: self.redirects.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            resume_restarts: self.resume_restarts.load(Ordering::Relaxed),
            pipeline_collisions: self.pipeline_collisions.load(Ordering::Relaxed),
            bytes_from_upstream: self.bytes_from_upstream.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            total_request_duration_us: self.total_request_duration_us.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    ///
    /// This is primarily useful for testing.
    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.head_requests,
            &self.rejected_requests,
            &self.client_disconnects,
            &self.active_connections,
            &self.cache_hits,
            &self.cache_misses,
            &self.downloads_started,
            &self.downloads_completed,
            &self.downloads_failed,
            &self.redirects,
            &self.failovers,
            &self.resume_restarts,
            &self.pipeline_collisions,
            &self.bytes_from_upstream,
            &self.bytes_to_client,
            &self.total_request_duration_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl MetricsSnapshot {
    /// Calculate cache hit rate as a percentage (0.0 to 100.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate average request duration in milliseconds
    pub fn avg_request_duration_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.total_request_duration_us as f64 / self.total_requests as f64) / 1000.0
        }
    }

    /// Calculate download failure rate as a percentage (0.0 to 100.0)
    pub fn download_failure_rate(&self) -> f64 {
        let finished = self.downloads_completed + self.downloads_failed;
        if finished == 0 {
            0.0
        } else {
            (self.downloads_failed as f64 / finished as f64) * 100.0
        }
    }
}
