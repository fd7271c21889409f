//! Process-wide state shared by every connection and downloader

use crate::blacklist::BackendBlacklist;
use crate::config::ProxyConfig;
use crate::conn_pool::{ConnectionPool, Connector, TcpConnector};
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;
use crate::path_classifier::PathClassifier;
use crate::registry::CacheRegistry;
use crate::upstream_metrics::UpstreamMetrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Shared proxy state, injected into every connection
pub struct ProxyContext {
    pub config: Arc<ProxyConfig>,
    pub classifier: PathClassifier,
    pub registry: Arc<CacheRegistry>,
    pub blacklist: BackendBlacklist,
    pub pool: ConnectionPool,
    pub metrics: Arc<ProxyMetrics>,
    pub upstream_metrics: UpstreamMetrics,
    pub prometheus: prometheus::Registry,
    shutdown: watch::Sender<bool>,
    next_agent_id: AtomicU64,
}

impl ProxyContext {
    /// Build the context with a TCP/TLS connector
    pub fn new(config: ProxyConfig) -> Result<Arc<Self>> {
        let connector = TcpConnector::new(config.network_timeout())?;
        Self::with_connector(config, Arc::new(connector))
    }

    /// Build the context with a custom upstream connector
    pub fn with_connector(config: ProxyConfig, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        config.validate()?;
        let classifier = PathClassifier::new(&config)?;
        let registry = CacheRegistry::new(
            config.cache_dir.clone(),
            config.idle_grace(),
            config.keep_warm_threshold,
        );
        let blacklist = BackendBlacklist::new(config.blacklist_duration());
        let pool = ConnectionPool::new(
            connector,
            config.pool.max_idle_per_host,
            Duration::from_secs(config.pool.idle_timeout_secs),
        );
        let prometheus = prometheus::Registry::new();
        let upstream_metrics = UpstreamMetrics::with_registry(&prometheus)
            .map_err(|e| ProxyError::InternalError(format!("metrics registration: {}", e)))?;
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(ProxyContext {
            config: Arc::new(config),
            classifier,
            registry,
            blacklist,
            pool,
            metrics: Arc::new(ProxyMetrics::new()),
            upstream_metrics,
            prometheus,
            shutdown,
            next_agent_id: AtomicU64::new(1),
        }))
    }

    /// Unique id for a download agent
    pub fn next_agent_id(&self) -> u64 {
        self.next_agent_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Freshness window handed to new entries
    pub fn freshness_for(&self, volatile: bool) -> Option<Duration> {
        volatile.then(|| self.config.volatile_max_age())
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown has been triggered
    pub async fn wait_shutdown(&self) {
        let mut rx = self.shutdown.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Broadcast shutdown: stop in-flight downloads and drop idle upstreams
    pub fn trigger_shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("Shutting down, stopping in-flight downloads");
        self.registry.shutdown();
        self.pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_shutdown_is_broadcast() {
        let dir = TempDir::new().unwrap();
        let config = ProxyConfig {
            cache_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let ctx = ProxyContext::new(config).unwrap();
        assert!(!ctx.is_shutting_down());
        assert_ne!(ctx.next_agent_id(), ctx.next_agent_id());

        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.wait_shutdown().await })
        };
        ctx.trigger_shutdown();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.is_shutting_down());

        // Late waiters return immediately
        ctx.wait_shutdown().await;
    }
}
