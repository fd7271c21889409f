//! Mirror failover and backend blacklisting

use pkg_relay::{BackendBlacklist, ProxyConfig, ProxyContext, ProxyServer, RepositoryConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Helper Functions
// ============================================================================

fn config_with_backends(dir: &TempDir, backends: Vec<String>, marker_file: Option<&str>) -> ProxyConfig {
    ProxyConfig {
        cache_dir: dir.path().to_path_buf(),
        max_retries: 1,
        repositories: vec![RepositoryConfig {
            name: "debian".to_string(),
            backends,
            marker_file: marker_file.map(str::to_string),
            remap_prefixes: vec![],
        }],
        ..Default::default()
    }
}

async fn start_proxy(config: ProxyConfig) -> (Arc<ProxyContext>, SocketAddr) {
    let ctx = ProxyContext::new(config).unwrap();
    let server = ProxyServer::bind_to(Arc::clone(&ctx), "127.0.0.1:0")
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (ctx, addr)
}

async fn get(addr: SocketAddr, target: &str) -> reqwest::Response {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .unwrap()
        .get(format!("http://{}{}", addr, target))
        .send()
        .await
        .unwrap()
}

/// Address nothing listens on
async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn backend_key(mock: &MockServer) -> String {
    let addr = mock.address();
    BackendBlacklist::key(&addr.ip().to_string(), addr.port())
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_server_error_fails_over_and_blacklists() {
    let broken = MockServer::start().await;
    let healthy = MockServer::start().await;

    // Only the first request reaches the broken mirror
    Mock::given(any())
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&broken)
        .await;
    Mock::given(method("GET"))
        .and(path("/debian/pool/a.deb"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"from mirror two".to_vec()))
        .expect(1)
        .mount(&healthy)
        .await;
    Mock::given(method("GET"))
        .and(path("/debian/pool/b.deb"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"second file".to_vec()))
        .expect(1)
        .mount(&healthy)
        .await;

    let dir = TempDir::new().unwrap();
    let backends = vec![
        format!("{}/debian", broken.uri()),
        format!("{}/debian", healthy.uri()),
    ];
    let (ctx, addr) = start_proxy(config_with_backends(&dir, backends, None)).await;

    let first = get(addr, "/debian/pool/a.deb").await;
    assert_eq!(first.status(), 200);
    assert_eq!(first.bytes().await.unwrap().as_ref(), b"from mirror two");
    assert!(ctx.blacklist.is_blocked(&backend_key(&broken)));
    assert!(!ctx.blacklist.is_blocked(&backend_key(&healthy)));

    // The blacklisted mirror is skipped for other files
    let second = get(addr, "/debian/pool/b.deb").await;
    assert_eq!(second.status(), 200);
    assert_eq!(second.bytes().await.unwrap().as_ref(), b"second file");
    assert_eq!(ctx.metrics.get_stats().failovers, 1);
}

#[tokio::test]
async fn test_unreachable_backend_is_retried_then_skipped() {
    let dead = dead_address().await;
    let healthy = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/debian/pool/c.deb"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"reachable".to_vec()))
        .expect(1)
        .mount(&healthy)
        .await;

    let dir = TempDir::new().unwrap();
    let backends = vec![
        format!("http://{}/debian/", dead),
        format!("{}/debian/", healthy.uri()),
    ];
    let (ctx, addr) = start_proxy(config_with_backends(&dir, backends, None)).await;

    let response = get(addr, "/debian/pool/c.deb").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"reachable");
    assert!(ctx
        .blacklist
        .is_blocked(&BackendBlacklist::key("127.0.0.1", dead.port())));
}

#[tokio::test]
async fn test_all_backends_failing_reports_bad_gateway() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;

    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&first)
        .await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&second)
        .await;

    let dir = TempDir::new().unwrap();
    let backends = vec![
        format!("{}/debian/", first.uri()),
        format!("{}/debian/", second.uri()),
    ];
    let (_ctx, addr) = start_proxy(config_with_backends(&dir, backends, None)).await;

    let response = get(addr, "/debian/pool/d.deb").await;
    assert_eq!(response.status(), 502);
    assert!(!dir.path().join("debian/pool/d.deb").exists());
}

#[tokio::test]
async fn test_missing_marker_file_disqualifies_mirror() {
    let stale = MockServer::start().await;
    let current = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/debian/dists/stable/Release"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&stale)
        .await;
    Mock::given(method("GET"))
        .and(path("/debian/dists/stable/Release"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"Suite: stable\n".to_vec()))
        .expect(1)
        .mount(&current)
        .await;

    let dir = TempDir::new().unwrap();
    let backends = vec![
        format!("{}/debian/", stale.uri()),
        format!("{}/debian/", current.uri()),
    ];
    let config = config_with_backends(&dir, backends, Some("dists/stable/Release"));
    let (ctx, addr) = start_proxy(config).await;

    let response = get(addr, "/debian/dists/stable/Release").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"Suite: stable\n");
    assert!(ctx.blacklist.is_blocked(&backend_key(&stale)));
}
