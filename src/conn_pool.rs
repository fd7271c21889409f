//! Upstream connection pool
//!
//! Hands out reusable upstream streams keyed by host, port and TLS flag.
//! Establishing new streams goes through a `Connector`, so tests can swap
//! the network for in-memory pipes.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Byte stream to an upstream server
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

/// Identity of a poolable upstream connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        PoolKey {
            host: host.into().to_ascii_lowercase(),
            port,
            tls,
        }
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Opens new upstream streams
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, key: &PoolKey) -> Result<Box<dyn UpstreamIo>>;
}

/// Resolve `host:port` to socket addresses
pub async fn resolve(host: &str, port: u16, limit: Duration) -> Result<Vec<SocketAddr>> {
    let lookup = timeout(limit, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| ProxyError::Timeout(format!("resolving {}", host)))?
        .map_err(|e| ProxyError::ConnectFailed(format!("cannot resolve {}: {}", host, e)))?;
    let addrs: Vec<SocketAddr> = lookup.collect();
    if addrs.is_empty() {
        return Err(ProxyError::ConnectFailed(format!("no addresses for {}", host)));
    }
    Ok(addrs)
}

/// Plain TCP connector with optional TLS on top
pub struct TcpConnector {
    timeout: Duration,
    tls: tokio_native_tls::TlsConnector,
}

impl TcpConnector {
    /// Create a connector whose connect and handshake steps are bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let tls = tokio_native_tls::native_tls::TlsConnector::new()
            .map_err(|e| ProxyError::ConfigError(format!("TLS setup failed: {}", e)))?;
        Ok(TcpConnector {
            timeout,
            tls: tokio_native_tls::TlsConnector::from(tls),
        })
    }

    async fn connect_tcp(&self, key: &PoolKey) -> Result<TcpStream> {
        let addrs = resolve(&key.host, key.port, self.timeout).await?;
        let mut last_err = None;
        for addr in addrs {
            match timeout(self.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Cannot set TCP_NODELAY towards {}: {}", key, e);
                    }
                    debug!("Connected to {} via {}", key, addr);
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!("Connect to {} via {} failed: {}", key, addr, e);
                    last_err = Some(ProxyError::ConnectFailed(format!("{}: {}", key, e)));
                }
                Err(_) => {
                    last_err = Some(ProxyError::Timeout(format!("connecting to {}", key)));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ProxyError::ConnectFailed(key.to_string())))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, key: &PoolKey) -> Result<Box<dyn UpstreamIo>> {
        let stream = self.connect_tcp(key).await?;
        if !key.tls {
            return Ok(Box::new(stream));
        }
        let tls = timeout(self.timeout, self.tls.connect(&key.host, stream))
            .await
            .map_err(|_| ProxyError::Timeout(format!("TLS handshake with {}", key)))?
            .map_err(|e| ProxyError::ConnectFailed(format!("TLS handshake with {}: {}", key, e)))?;
        Ok(Box::new(tls))
    }
}

/// A stream checked out of the pool
pub struct UpstreamStream {
    key: PoolKey,
    io: Box<dyn UpstreamIo>,
    reused: bool,
}

impl UpstreamStream {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Whether the stream was idle in the pool before; such streams may
    /// have been closed by the server in the meantime
    pub fn is_reused(&self) -> bool {
        self.reused
    }
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

struct IdleStream {
    io: Box<dyn UpstreamIo>,
    since: Instant,
}

/// Process-wide pool of idle upstream streams
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    idle: Mutex<HashMap<PoolKey, Vec<IdleStream>>>,
    max_idle_per_host: usize,
    idle_timeout: Duration,
}

impl ConnectionPool {
    /// Create a new pool
    ///
    /// # Arguments
    /// * `connector` - Opens streams when no idle one is available
    /// * `max_idle_per_host` - Idle streams kept per key
    /// * `idle_timeout` - Idle streams older than this are discarded
    pub fn new(connector: Arc<dyn Connector>, max_idle_per_host: usize, idle_timeout: Duration) -> Self {
        ConnectionPool {
            connector,
            idle: Mutex::new(HashMap::new()),
            max_idle_per_host,
            idle_timeout,
        }
    }

    /// Check out an idle stream for `key` or open a new one
    pub async fn acquire(&self, key: &PoolKey) -> Result<UpstreamStream> {
        if let Some(io) = self.take_idle(key) {
            debug!("Reusing pooled connection to {}", key);
            return Ok(UpstreamStream {
                key: key.clone(),
                io,
                reused: true,
            });
        }

        let io = self.connector.connect(key).await.map_err(|e| {
            warn!("Failed to connect to {}: {}", key, e);
            e
        })?;
        Ok(UpstreamStream {
            key: key.clone(),
            io,
            reused: false,
        })
    }

    fn take_idle(&self, key: &PoolKey) -> Option<Box<dyn UpstreamIo>> {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        let streams = idle.get_mut(key)?;
        let now = Instant::now();
        streams.retain(|s| now.duration_since(s.since) < self.idle_timeout);
        let found = streams.pop().map(|s| s.io);
        if streams.is_empty() {
            idle.remove(key);
        }
        found
    }

    /// Return a stream that finished its last response cleanly
    pub fn release(&self, stream: UpstreamStream) {
        if self.max_idle_per_host == 0 {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        let streams = idle.entry(stream.key).or_default();
        if streams.len() >= self.max_idle_per_host {
            streams.remove(0);
        }
        streams.push(IdleStream {
            io: stream.io,
            since: Instant::now(),
        });
    }

    /// Number of idle streams across all keys
    pub fn idle_count(&self) -> usize {
        let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.values().map(Vec::len).sum()
    }

    /// Drop every idle stream
    pub fn clear(&self) {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct PipeConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for PipeConnector {
        async fn connect(&self, _key: &PoolKey) -> Result<Box<dyn UpstreamIo>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (client, _server) = tokio::io::duplex(64);
            Ok(Box::new(client))
        }
    }

    fn pool(max_idle: usize, idle_timeout: Duration) -> (ConnectionPool, Arc<PipeConnector>) {
        let connector = Arc::new(PipeConnector {
            connects: AtomicUsize::new(0),
        });
        let pool = ConnectionPool::new(connector.clone(), max_idle, idle_timeout);
        (pool, connector)
    }

    #[tokio::test]
    async fn test_release_then_reuse() {
        let (pool, connector) = pool(2, Duration::from_secs(30));
        let key = PoolKey::new("Mirror", 80, false);
        assert_eq!(key.host, "mirror");

        let first = pool.acquire(&key).await.unwrap();
        assert!(!first.is_reused());
        pool.release(first);
        assert_eq!(pool.idle_count(), 1);

        let second = pool.acquire(&key).await.unwrap();
        assert!(second.is_reused());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        let other = pool.acquire(&PoolKey::new("mirror", 443, true)).await.unwrap();
        assert!(!other.is_reused());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_idle_limit_and_timeout() {
        let (pool, _) = pool(1, Duration::from_millis(20));
        let key = PoolKey::new("m", 80, false);
        let a = pool.acquire(&key).await.unwrap();
        let b = pool.acquire(&key).await.unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let c = pool.acquire(&key).await.unwrap();
        assert!(!c.is_reused());
    }

    #[tokio::test]
    async fn test_tcp_connector_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hi").await.unwrap();
        });

        let connector = TcpConnector::new(Duration::from_secs(5)).unwrap();
        let mut io = connector
            .connect(&PoolKey::new("127.0.0.1", port, false))
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::new(Duration::from_secs(5)).unwrap();
        let result = connector.connect(&PoolKey::new("127.0.0.1", port, false)).await;
        assert!(matches!(result, Err(ProxyError::ConnectFailed(_))));
    }
}
