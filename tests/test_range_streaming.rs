//! Ranged and streamed responses while the upstream transfer is in progress

use bytes::{Buf, BytesMut};
use pkg_relay::{HttpHeader, ProxyConfig, ProxyContext, ProxyServer, RepositoryConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const TOTAL: usize = 100_000;
const FIRST_PART: usize = 60_000;

// ============================================================================
// Helper Functions
// ============================================================================

fn payload() -> Vec<u8> {
    (0..TOTAL).map(|i| (i % 253) as u8).collect()
}

async fn start_proxy(dir: &TempDir, upstream: SocketAddr) -> (Arc<ProxyContext>, SocketAddr) {
    let config = ProxyConfig {
        cache_dir: dir.path().to_path_buf(),
        repositories: vec![RepositoryConfig {
            name: "debian".to_string(),
            backends: vec![format!("http://{}/debian/", upstream)],
            marker_file: None,
            remap_prefixes: vec![],
        }],
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

/// Read one request header off an upstream connection
async fn read_request(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<HttpHeader> {
    loop {
        if let Some((header, used)) = HttpHeader::parse(buf).unwrap() {
            buf.advance(used);
            return Some(header);
        }
        if stream.read_buf(buf).await.unwrap() == 0 {
            return None;
        }
    }
}

/// Upstream that sends the first part of the body and holds the rest back
/// until `release` fires
async fn stalling_upstream(body: Vec<u8>, release: oneshot::Receiver<()>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        let request = read_request(&mut stream, &mut buf).await.unwrap();
        assert_eq!(request.target(), Some("/debian/pool/main/l/linux/linux-image.deb"));

        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nLast-Modified: Tue, 01 Oct 2024 10:00:00 GMT\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(&body[..FIRST_PART]).await.unwrap();
        let _ = release.await;
        stream.write_all(&body[FIRST_PART..]).await.unwrap();

        // Keep the connection open for pooling
        let _ = read_request(&mut stream, &mut buf).await;
    });
    addr
}

async fn wait_for_confirmed(ctx: &ProxyContext, dir: &TempDir, bytes: u64) {
    let path = dir.path().join("debian/pool/main/l/linux/linux-image.deb");
    for _ in 0..200 {
        if std::fs::metadata(&path).map(|m| m.len() >= bytes).unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "download never reached {} bytes (live entries: {})",
        bytes,
        ctx.registry.live_entries()
    );
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_range_served_while_downloading() {
    let body = payload();
    let (release, gate) = oneshot::channel();
    let upstream = stalling_upstream(body.clone(), gate).await;
    let dir = TempDir::new().unwrap();
    let (ctx, addr) = start_proxy(&dir, upstream).await;
    let url = format!("http://{}/debian/pool/main/l/linux/linux-image.deb", addr);
    let client = reqwest::Client::builder().no_proxy().build().unwrap();

    // First client streams the whole file and sees the first part early
    let mut full = client.get(&url).send().await.unwrap();
    assert_eq!(full.status(), 200);
    assert_eq!(full.headers().get("content-length").unwrap(), "100000");
    let mut received = Vec::new();
    while received.len() < FIRST_PART {
        let chunk = full.chunk().await.unwrap().expect("body ended early");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received.len(), FIRST_PART);
    wait_for_confirmed(&ctx, &dir, FIRST_PART as u64).await;

    // A range that starts inside the cached part is answered right away
    let ranged = client
        .get(&url)
        .header("Range", "bytes=50000-")
        .send()
        .await
        .unwrap();
    assert_eq!(ranged.status(), 206);
    assert_eq!(
        ranged.headers().get("content-range").unwrap(),
        "bytes 50000-99999/100000"
    );
    assert_eq!(ranged.headers().get("content-length").unwrap(), "50000");

    release.send(()).unwrap();
    let ranged_body = ranged.bytes().await.unwrap();
    assert_eq!(ranged_body.as_ref(), &body[50_000..]);

    while let Some(chunk) = full.chunk().await.unwrap() {
        received.extend_from_slice(&chunk);
    }
    assert!(received == body);

    // Beyond the end
    let beyond = client
        .get(&url)
        .header("Range", "bytes=150000-")
        .send()
        .await
        .unwrap();
    assert_eq!(beyond.status(), 416);
    assert_eq!(
        beyond.headers().get("content-range").unwrap(),
        "bytes */100000"
    );
}

#[tokio::test]
async fn test_suffix_and_closed_ranges_from_cache() {
    let body = payload();
    let (release, gate) = oneshot::channel();
    release.send(()).unwrap();
    let upstream = stalling_upstream(body.clone(), gate).await;
    let dir = TempDir::new().unwrap();
    let (_ctx, addr) = start_proxy(&dir, upstream).await;
    let url = format!("http://{}/debian/pool/main/l/linux/linux-image.deb", addr);
    let client = reqwest::Client::builder().no_proxy().build().unwrap();

    let whole = client.get(&url).send().await.unwrap().bytes().await.unwrap();
    assert_eq!(whole.len(), TOTAL);

    let closed = client
        .get(&url)
        .header("Range", "bytes=10-19")
        .send()
        .await
        .unwrap();
    assert_eq!(closed.status(), 206);
    assert_eq!(closed.headers().get("content-range").unwrap(), "bytes 10-19/100000");
    assert_eq!(closed.bytes().await.unwrap().as_ref(), &body[10..20]);

    let suffix = client
        .get(&url)
        .header("Range", "bytes=-100")
        .send()
        .await
        .unwrap();
    assert_eq!(suffix.status(), 206);
    assert_eq!(
        suffix.headers().get("content-range").unwrap(),
        "bytes 99900-99999/100000"
    );
    assert_eq!(suffix.bytes().await.unwrap().as_ref(), &body[TOTAL - 100..]);

    // A stale validator turns the range into a full response
    let mismatch = client
        .get(&url)
        .header("Range", "bytes=10-19")
        .header("If-Range", "Mon, 01 Jan 2024 00:00:00 GMT")
        .send()
        .await
        .unwrap();
    assert_eq!(mismatch.status(), 200);
    assert_eq!(mismatch.bytes().await.unwrap().len(), TOTAL);
}
