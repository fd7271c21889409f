//! Malformed and refused client requests

use pkg_relay::{ProxyConfig, ProxyContext, ProxyServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// ============================================================================
// Helper Functions
// ============================================================================

async fn start_proxy(dir: &TempDir) -> (Arc<ProxyContext>, SocketAddr) {
    let config = ProxyConfig {
        cache_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let ctx = ProxyContext::new(config).unwrap();
    let server = ProxyServer::bind_to(Arc::clone(&ctx), "127.0.0.1:0")
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (ctx, addr)
}

/// Send raw bytes and read until the proxy closes the connection
async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("proxy kept a broken connection open")
        .unwrap();
    response
}

fn status_line(response: &[u8]) -> &[u8] {
    let end = response
        .windows(2)
        .position(|w| w == b"\r\n")
        .expect("no status line");
    &response[..end]
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_garbage_request_line_is_bad_request() {
    let dir = TempDir::new().unwrap();
    let (ctx, addr) = start_proxy(&dir).await;

    let response = raw_exchange(addr, b"GARBAGE\r\n\r\n").await;
    assert_eq!(status_line(&response), b"HTTP/1.0 400 Bad Request");
    assert!(!String::from_utf8_lossy(&response).contains("GARBAGE"));
    assert_eq!(ctx.metrics.get_stats().downloads_started, 0);
}

#[tokio::test]
async fn test_client_bytes_never_reach_status_line() {
    let dir = TempDir::new().unwrap();
    let (_ctx, addr) = start_proxy(&dir).await;

    let response = raw_exchange(addr, b"GET /debian/x HTTP/1.1\r\nNo\rColon\r\n\r\n").await;
    let line = status_line(&response);
    assert_eq!(line, b"HTTP/1.0 400 Bad Request");
    assert!(!line.contains(&b'\r'));
    assert!(!String::from_utf8_lossy(&response).contains("Colon"));
}

#[tokio::test]
async fn test_refused_requests_keep_fixed_reasons() {
    let dir = TempDir::new().unwrap();
    let (_ctx, addr) = start_proxy(&dir).await;

    let response = raw_exchange(
        addr,
        b"PUT /debian/pool/x.deb HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(status_line(&response), b"HTTP/1.1 405 Method Not Allowed");

    let response = raw_exchange(
        addr,
        b"GET /debian/../etc/passwd HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(status_line(&response), b"HTTP/1.1 403 Forbidden");
    assert!(!String::from_utf8_lossy(&response).contains("passwd"));
}
