//! Chunked upstream bodies, HTTP/1.0 clients and pipelined requests

use bytes::{Buf, BytesMut};
use pkg_relay::{HttpHeader, ParseEvent, ProxyConfig, ProxyContext, ProxyServer, RepositoryConfig, ResponseParser};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

// ============================================================================
// Helper Functions
// ============================================================================

async fn start_proxy(dir: &TempDir, upstream: SocketAddr) -> (Arc<ProxyContext>, SocketAddr) {
    let config = ProxyConfig {
        cache_dir: dir.path().to_path_buf(),
        repositories: vec![RepositoryConfig {
            name: "arch".to_string(),
            backends: vec![format!("http://{}/archlinux/", upstream)],
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

async fn read_request(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<HttpHeader> {
    loop {
        if let Some((header, used)) = HttpHeader::parse(buf).ok()? {
            buf.advance(used);
            return Some(header);
        }
        match stream.read_buf(buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Send a raw request and read until the proxy closes the connection
async fn raw_exchange(addr: SocketAddr, request: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}

/// Split a complete response into its header and decoded body
fn decode_response(raw: &[u8]) -> (HttpHeader, Vec<u8>) {
    let mut buf = BytesMut::from(raw);
    let mut parser = ResponseParser::new(false);
    let mut header = None;
    let mut body = Vec::new();
    loop {
        match parser.step(&mut buf).unwrap() {
            ParseEvent::Header(h) => header = Some(h),
            ParseEvent::Data(data) => body.extend_from_slice(&data),
            ParseEvent::Finished => break,
            ParseEvent::NeedMore => match parser.on_eof().unwrap() {
                ParseEvent::Finished => break,
                other => panic!("unexpected event at end of input: {:?}", other),
            },
        }
    }
    (header.unwrap(), body)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_chunked_upstream_is_streamed_and_stored() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    let (release, gate) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        read_request(&mut stream, &mut buf).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n")
            .await
            .unwrap();
        let _ = gate.await;
        stream
            .write_all(b"6\r\n world\r\n0\r\n\r\n")
            .await
            .unwrap();
        let _ = read_request(&mut stream, &mut buf).await;
    });

    let dir = TempDir::new().unwrap();
    let (_ctx, addr) = start_proxy(&dir, upstream).await;

    // Length unknown while downloading: HTTP/1.1 clients get chunked framing
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /arch/core/os/x86_64/core.db HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut seen = BytesMut::new();
    while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
        assert!(client.read_buf(&mut seen).await.unwrap() > 0);
    }
    release.send(()).unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    seen.extend_from_slice(&rest);

    let (header, body) = decode_response(&seen);
    assert_eq!(header.status(), Some(200));
    assert!(header.is_chunked());
    assert_eq!(body, b"hello world");

    // The stored sidecar carries the real length
    assert_eq!(
        std::fs::read(dir.path().join("arch/core/os/x86_64/core.db")).unwrap(),
        b"hello world"
    );
    let sidecar = std::fs::read(dir.path().join("arch/core/os/x86_64/core.db.head")).unwrap();
    let (stored, _) = HttpHeader::parse(&sidecar).unwrap().unwrap();
    assert_eq!(stored.content_length(), Some(11));

    // Served from cache with a length
    let cached = raw_exchange(
        addr,
        "GET /arch/core/os/x86_64/core.db HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n",
    )
    .await;
    let (header, body) = decode_response(&cached);
    assert_eq!(header.content_length(), Some(11));
    assert_eq!(body, b"hello world");
}

#[tokio::test]
async fn test_http10_client_gets_close_delimited_body() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        read_request(&mut stream, &mut buf).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n")
            .await
            .unwrap();
        let _ = read_request(&mut stream, &mut buf).await;
    });

    let dir = TempDir::new().unwrap();
    let (_ctx, addr) = start_proxy(&dir, upstream).await;

    let raw = raw_exchange(addr, "GET /arch/extra/os/x86_64/extra.db HTTP/1.0\r\n\r\n").await;
    let (header, body) = decode_response(&raw);
    assert_eq!(header.status(), Some(200));
    assert!(!header.is_chunked());
    assert_eq!(body, b"abcdef");
}

#[tokio::test]
async fn test_pipelined_requests_share_one_upstream_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let accepted = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = BytesMut::new();
                while let Some(request) = read_request(&mut stream, &mut buf).await {
                    let name = request.target().unwrap_or_default().rsplit('/').next().unwrap_or_default().to_string();
                    let body = format!("contents of {}", name);
                    let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let dir = TempDir::new().unwrap();
    let (ctx, addr) = start_proxy(&dir, upstream).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(
            b"GET /arch/pool/one.pkg.tar.zst HTTP/1.1\r\nHost: proxy\r\n\r\n\
              GET /arch/pool/two.pkg.tar.zst HTTP/1.1\r\nHost: proxy\r\n\r\n\
              GET /arch/pool/three.pkg.tar.zst HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let mut raw = Vec::new();
    client.read_to_end(&mut raw).await.unwrap();

    // Responses arrive in request order
    let mut buf = BytesMut::from(&raw[..]);
    for name in ["one", "two", "three"] {
        let mut parser = ResponseParser::new(false);
        let mut body = Vec::new();
        loop {
            match parser.step(&mut buf).unwrap() {
                ParseEvent::Header(h) => assert_eq!(h.status(), Some(200)),
                ParseEvent::Data(data) => body.extend_from_slice(&data),
                ParseEvent::Finished => break,
                ParseEvent::NeedMore => panic!("truncated response for {}", name),
            }
        }
        assert_eq!(body, format!("contents of {}.pkg.tar.zst", name).into_bytes());
    }
    assert!(buf.is_empty());

    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.metrics.get_stats().downloads_started, 3);
}
