//! pkg-relay
//!
//! A caching proxy for package-manager HTTP traffic. Clients fetch package
//! files and repository indexes through the proxy; the first request for a
//! file starts one upstream download and every concurrent request for the
//! same file is served from the growing cache copy while it downloads.
//!
//! # Overview
//!
//! - Concurrent requests for one resource trigger at most one upstream fetch
//! - Partial downloads resume with a probe byte that validates the cached
//!   prefix before anything is appended
//! - Clients only ever receive bytes that were written and flushed to the
//!   cache data file
//! - Repositories map to ordered mirror lists with failover and a shared,
//!   time-bounded blacklist
//!
//! # Architecture
//!
//! - [`Connection`]: owns one client socket and answers pipelined requests
//!   in order
//! - [`RequestJob`]: serving state machine for one request (plain, ranged
//!   or chunked responses)
//! - [`CacheRegistry`] / [`CacheEntry`]: deduplicated shared cache entries
//!   with watch-channel wakeups
//! - [`Downloader`]: per-connection upstream agent with pipelining,
//!   redirects and mirror failover
//! - [`HttpHeader`] / [`ResponseParser`]: header codec and sans-IO upstream
//!   response parser
//! - [`ConnectionPool`]: reusable upstream TCP/TLS streams
//!
//! # Configuration
//!
//! Configuration is loaded from a YAML file:
//!
//! ```yaml
//! listen_address: "0.0.0.0:3142"
//! cache_dir: "/var/cache/pkg-relay"
//! repositories:
//!   - name: debian
//!     backends:
//!       - "http://deb.debian.org/debian/"
//!       - "http://ftp.de.debian.org/debian/"
//!     marker_file: "dists/stable/Release"
//! ```
//!
//! See [`ProxyConfig`] for all options.
//!
//! # Example
//!
//! ```rust,no_run
//! use pkg_relay::{ProxyConfig, ProxyContext, ProxyServer};
//!
//! # async fn run() -> pkg_relay::Result<()> {
//! let config = ProxyConfig::from_file("pkg-relay.yaml")?;
//! let ctx = ProxyContext::new(config)?;
//! let server = ProxyServer::bind(ctx).await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod blacklist;
pub mod cache_entry;
pub mod config;
pub mod conn_pool;
pub mod connection;
pub mod context;
pub mod downloader;
pub mod error;
pub mod header;
pub mod metrics;
pub mod metrics_endpoint;
pub mod models;
pub mod path_classifier;
pub mod registry;
pub mod request_job;
pub mod response_parser;
pub mod server;
pub mod sink;
pub mod upstream_metrics;

// Re-export commonly used types
pub use blacklist::BackendBlacklist;
pub use cache_entry::{BeginOutcome, CacheEntry, EntrySnapshot, EntryStatus};
pub use config::{ProxyConfig, RepositoryConfig};
pub use conn_pool::{ConnectionPool, Connector, PoolKey, TcpConnector};
pub use connection::Connection;
pub use context::ProxyContext;
pub use downloader::{DownloadTask, Downloader, RetryPolicy};
pub use error::{ProxyError, Result};
pub use header::{HeaderField, HttpHeader, HttpVersion};
pub use metrics::{MetricsSnapshot, ProxyMetrics};
pub use metrics_endpoint::MetricsEndpoint;
pub use models::{ByteRange, ContentRange, RangeRequest};
pub use path_classifier::{DownloadSource, PathClassifier, Target};
pub use registry::{CacheRegistry, EntryHandle, SharingPolicy};
pub use request_job::{Advance, RequestJob};
pub use response_parser::{ParseEvent, ResponseParser};
pub use server::ProxyServer;
pub use upstream_metrics::UpstreamMetrics;
