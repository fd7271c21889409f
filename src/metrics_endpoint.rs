//! Metrics HTTP Endpoint
//!
//! Serves `/metrics` in Prometheus text format, `/stats` as JSON and
//! `/health` on a separate port.

use crate::context::ProxyContext;
use crate::error::Result;
use crate::metrics::MetricsSnapshot;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::Encoder;
use serde::Serialize;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Metrics endpoint server
pub struct MetricsEndpoint {
    ctx: Arc<ProxyContext>,
    listener: TcpListener,
}

/// JSON body of `/stats`
#[derive(Debug, Serialize)]
struct StatsReport {
    #[serde(flatten)]
    counters: MetricsSnapshot,
    cache_hit_rate: f64,
    download_failure_rate: f64,
    avg_request_duration_ms: f64,
    live_entries: usize,
    blacklisted_backends: usize,
    idle_upstream_connections: usize,
}

impl MetricsEndpoint {
    /// Bind the endpoint
    ///
    /// # Arguments
    /// * `ctx` - Shared proxy state to report on
    /// * `addr` - Address to bind the HTTP server to
    pub async fn bind(ctx: Arc<ProxyContext>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { ctx, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until shutdown
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Metrics available at http://{}/metrics", addr);

        loop {
            let ctx = Arc::clone(&self.ctx);
            let (stream, _) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = ctx.wait_shutdown() => return Ok(()),
            };
            let io = TokioIo::new(stream);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let ctx = Arc::clone(&ctx);
                    async move { handle_request(req, ctx).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: Arc<ProxyContext>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(match req.uri().path() {
        "/metrics" => metrics_response(&ctx),
        "/stats" => stats_response(&ctx),
        "/health" => health_response(&ctx),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "404 Not Found".to_string()),
    })
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn metrics_response(ctx: &ProxyContext) -> Response<Full<Bytes>> {
    let mut body = format_prometheus_metrics(&ctx.metrics.get_stats());

    let mut buffer = Vec::new();
    if prometheus::TextEncoder::new()
        .encode(&ctx.prometheus.gather(), &mut buffer)
        .is_ok()
    {
        body.push_str(&String::from_utf8_lossy(&buffer));
    }

    respond(
        StatusCode::OK,
        "text/plain; version=0.0.4; charset=utf-8",
        body,
    )
}

fn stats_response(ctx: &ProxyContext) -> Response<Full<Bytes>> {
    let counters = ctx.metrics.get_stats();
    let report = StatsReport {
        cache_hit_rate: counters.cache_hit_rate(),
        download_failure_rate: counters.download_failure_rate(),
        avg_request_duration_ms: counters.avg_request_duration_ms(),
        counters,
        live_entries: ctx.registry.live_entries(),
        blacklisted_backends: ctx.blacklist.len(),
        idle_upstream_connections: ctx.pool.idle_count(),
    };
    match serde_json::to_string_pretty(&report) {
        Ok(json) => respond(StatusCode::OK, "application/json", json),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            format!("cannot encode stats: {}", e),
        ),
    }
}

fn health_response(ctx: &ProxyContext) -> Response<Full<Bytes>> {
    if ctx.is_shutting_down() {
        respond(
            StatusCode::SERVICE_UNAVAILABLE,
            "application/json",
            r#"{"status":"shutting_down"}"#.to_string(),
        )
    } else {
        respond(
            StatusCode::OK,
            "application/json",
            r#"{"status":"healthy"}"#.to_string(),
        )
    }
}

/// Format the counters in Prometheus exposition format
fn format_prometheus_metrics(snapshot: &MetricsSnapshot) -> String {
    let counters: [(&str, &str, u64); 15] = [
        ("requests_total", "Client requests parsed", snapshot.total_requests),
        ("head_requests_total", "Client HEAD requests", snapshot.head_requests),
        ("rejected_requests_total", "Requests refused before touching the cache", snapshot.rejected_requests),
        ("client_disconnects_total", "Responses cut short by the client or an error", snapshot.client_disconnects),
        ("cache_hits_total", "Requests served from a complete cached copy", snapshot.cache_hits),
        ("cache_misses_total", "Requests that needed an upstream download", snapshot.cache_misses),
        ("downloads_started_total", "Downloads assigned to an agent", snapshot.downloads_started),
        ("downloads_completed_total", "Downloads that completed or were revalidated", snapshot.downloads_completed),
        ("downloads_failed_total", "Downloads that ended in an error", snapshot.downloads_failed),
        ("redirects_total", "Upstream redirects followed", snapshot.redirects),
        ("failovers_total", "Switches to the next mirror", snapshot.failovers),
        ("resume_restarts_total", "Resumes that had to start from offset zero", snapshot.resume_restarts),
        ("pipeline_collisions_total", "Tasks dropped because another agent owned the entry", snapshot.pipeline_collisions),
        ("bytes_from_upstream_total", "Body bytes received from upstream", snapshot.bytes_from_upstream),
        ("bytes_to_client_total", "Body bytes sent to clients", snapshot.bytes_to_client),
    ];

    let mut output = String::new();
    for (name, help, value) in counters {
        let _ = writeln!(output, "# HELP pkg_relay_{} {}", name, help);
        let _ = writeln!(output, "# TYPE pkg_relay_{} counter", name);
        let _ = writeln!(output, "pkg_relay_{} {}\n", name, value);
    }

    let gauges: [(&str, &str, f64); 3] = [
        ("cache_hit_rate", "Cache hit rate percentage", snapshot.cache_hit_rate()),
        ("download_failure_rate", "Download failure rate percentage", snapshot.download_failure_rate()),
        ("request_duration_ms_avg", "Average request duration in milliseconds", snapshot.avg_request_duration_ms()),
    ];
    for (name, help, value) in gauges {
        let _ = writeln!(output, "# HELP pkg_relay_{} {}", name, help);
        let _ = writeln!(output, "# TYPE pkg_relay_{} gauge", name);
        let _ = writeln!(output, "pkg_relay_{} {:.2}\n", name, value);
    }

    let _ = writeln!(output, "# HELP pkg_relay_active_connections Open client connections");
    let _ = writeln!(output, "# TYPE pkg_relay_active_connections gauge");
    let _ = writeln!(output, "pkg_relay_active_connections {}\n", snapshot.active_connections);

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::metrics::ProxyMetrics;
    use tempfile::TempDir;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = ProxyMetrics::new();

        metrics.record_request(true);
        metrics.record_request(false);
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_bytes_from_upstream(1000);
        metrics.record_bytes_to_client(1500);
        metrics.record_failover();

        let output = format_prometheus_metrics(&metrics.get_stats());

        assert!(output.contains("pkg_relay_requests_total 2"));
        assert!(output.contains("pkg_relay_head_requests_total 1"));
        assert!(output.contains("pkg_relay_cache_hits_total 1"));
        assert!(output.contains("pkg_relay_bytes_from_upstream_total 1000"));
        assert!(output.contains("pkg_relay_bytes_to_client_total 1500"));
        assert!(output.contains("pkg_relay_failovers_total 1"));
        assert!(output.contains("pkg_relay_cache_hit_rate 50.00"));
        assert!(output.contains("# TYPE pkg_relay_requests_total counter"));
        assert!(output.contains("# TYPE pkg_relay_cache_hit_rate gauge"));
    }

    #[test]
    fn test_format_prometheus_metrics_empty() {
        let output = format_prometheus_metrics(&ProxyMetrics::new().get_stats());
        assert!(output.contains("pkg_relay_requests_total 0"));
        assert!(output.contains("pkg_relay_cache_hit_rate 0.00"));
    }

    #[tokio::test]
    async fn test_responses() {
        let dir = TempDir::new().unwrap();
        let config = ProxyConfig {
            cache_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let ctx = ProxyContext::new(config).unwrap();
        ctx.metrics.record_cache_hit();
        ctx.upstream_metrics.record_request("mirror:80");

        let response = metrics_response(&ctx);
        assert_eq!(response.status(), StatusCode::OK);

        let response = stats_response(&ctx);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );

        assert_eq!(health_response(&ctx).status(), StatusCode::OK);
        ctx.trigger_shutdown();
        assert_eq!(
            health_response(&ctx).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
