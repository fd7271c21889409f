//! One client connection
//!
//! A reader task parses pipelined request headers and hands them to the
//! serving loop, which answers them strictly in order. Downloads for all
//! queued requests are submitted as soon as the requests are parsed, so
//! upstream fetches for pipelined requests overlap with serving.

use crate::cache_entry::EntryStatus;
use crate::context::ProxyContext;
use crate::downloader::{DownloadTask, Downloader};
use crate::error::{ProxyError, Result};
use crate::header::{HeaderField, HttpHeader, HttpVersion, MessageKind};
use crate::registry::SharingPolicy;
use crate::request_job::{Advance, RequestJob};
use crate::sink::{ClientSink, ClientSocket};
use bytes::{Buf, BytesMut};
use http::Method;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

type Incoming = Result<HttpHeader>;

enum Wake {
    Entry,
    Request(Option<Incoming>),
    Shutdown,
}

/// State of one client connection
pub struct Connection {
    ctx: Arc<ProxyContext>,
    peer: SocketAddr,
    downloader: Option<Downloader>,
    jobs: VecDeque<(RequestJob, Instant)>,
    reading: bool,
}

impl Connection {
    pub fn new(ctx: Arc<ProxyContext>, peer: SocketAddr) -> Self {
        Connection {
            ctx,
            peer,
            downloader: None,
            jobs: VecDeque::new(),
            reading: true,
        }
    }

    /// Serve the client until it disconnects or the proxy shuts down
    pub async fn serve(mut self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Cannot set TCP_NODELAY for {}: {}", self.peer, e);
        }
        let (read_half, write_half) = stream.into_split();
        let mut sink = ClientSocket::new(write_half, self.ctx.config.zero_copy);

        let (tx, mut rx) = mpsc::channel(self.ctx.config.pipeline_depth.max(1));
        let reader = tokio::spawn(read_requests(read_half, tx));

        self.ctx.metrics.connection_opened();
        debug!("Client {} connected", self.peer);
        self.run(&mut sink, &mut rx).await;
        reader.abort();
        if let Err(e) = sink.flush().await {
            debug!("Final flush to {} failed: {}", self.peer, e);
        }
        self.ctx.metrics.connection_closed();
        debug!("Client {} done", self.peer);
    }

    async fn run<S: ClientSink + ?Sized>(&mut self, sink: &mut S, rx: &mut mpsc::Receiver<Incoming>) {
        let idle = self.ctx.config.network_timeout();
        loop {
            if self.jobs.is_empty() {
                if !self.reading {
                    return;
                }
                let ctx = Arc::clone(&self.ctx);
                tokio::select! {
                    incoming = rx.recv() => match incoming {
                        Some(incoming) => self.accept(incoming).await,
                        None => return,
                    },
                    _ = sleep(idle) => {
                        debug!("Client {} idle, closing", self.peer);
                        return;
                    }
                    _ = ctx.wait_shutdown() => return,
                }
            }
            while self.reading {
                match rx.try_recv() {
                    Ok(incoming) => self.accept(incoming).await,
                    Err(_) => break,
                }
            }
            let Some((job, _)) = self.jobs.front_mut() else {
                continue;
            };

            let advance = match timeout(idle, job.advance(sink)).await {
                Ok(advance) => advance,
                Err(_) => {
                    debug!("Client {} stopped reading", self.peer);
                    Advance::Disconnect
                }
            };
            match advance {
                Advance::CanSend => {}
                Advance::WaitForDownload => {
                    let wake = {
                        let ctx = Arc::clone(&self.ctx);
                        let reading = self.reading;
                        tokio::select! {
                            _ = job.wait() => Wake::Entry,
                            incoming = rx.recv(), if reading => Wake::Request(incoming),
                            _ = ctx.wait_shutdown() => Wake::Shutdown,
                        }
                    };
                    match wake {
                        Wake::Entry => {}
                        Wake::Request(Some(incoming)) => self.accept(incoming).await,
                        Wake::Request(None) => self.reading = false,
                        Wake::Shutdown => {
                            // Let the job observe the stopped entry
                            if let Some((job, _)) = self.jobs.front_mut() {
                                match timeout(idle, job.advance(sink)).await {
                                    Ok(advance) => debug!("Client {} at shutdown: {:?}", self.peer, advance),
                                    Err(_) => debug!("Client {} not reading at shutdown", self.peer),
                                }
                            }
                            return;
                        }
                    }
                }
                Advance::Disconnect => {
                    self.finish_front(false);
                    self.ctx.metrics.record_client_disconnect();
                    return;
                }
                Advance::Finished => {
                    let keep_alive = self.finish_front(true);
                    if !keep_alive {
                        return;
                    }
                }
            }
        }
    }

    /// Book-keeping for the job at the head of the queue
    fn finish_front(&mut self, completed: bool) -> bool {
        let Some((job, started)) = self.jobs.pop_front() else {
            return false;
        };
        self.ctx.metrics.record_bytes_to_client(job.bytes_sent());
        self.ctx.metrics.record_request_duration(started.elapsed());
        if let Some(entry) = job.entry() {
            debug!(
                "{} {} -> {} bytes{}",
                self.peer,
                entry.path(),
                job.bytes_sent(),
                if completed { "" } else { " (aborted)" }
            );
        }
        completed && job.keep_alive()
    }

    /// Turn a parsed request into a queued job
    async fn accept(&mut self, incoming: Incoming) {
        let started = Instant::now();
        let job = match incoming {
            Ok(request) => self.start_job(request).await,
            Err(e) => {
                warn!("Bad request from {}: {}", self.peer, e);
                self.ctx.metrics.record_rejected();
                self.reading = false;
                let mut request = HttpHeader::request(Method::GET, "/", HttpVersion::Http10);
                request.set(HeaderField::Connection, "close");
                RequestJob::rejected(request, e)
            }
        };
        self.jobs.push_back((job, started));
    }

    async fn start_job(&mut self, request: HttpHeader) -> RequestJob {
        let method = request.method().cloned().unwrap_or(Method::GET);
        let target = request.target().unwrap_or_default().to_string();
        self.ctx.metrics.record_request(method == Method::HEAD);

        let resolved = match self.ctx.classifier.resolve(&method, &target) {
            Ok(resolved) => resolved,
            Err(e) => {
                info!("Rejecting {} {} from {}: {}", method, target, self.peer, e);
                self.ctx.metrics.record_rejected();
                return RequestJob::rejected(request, e);
            }
        };

        let refresh = self.ctx.config.allow_client_refresh && request.wants_refresh();
        let policy = if refresh {
            SharingPolicy::AlwaysReplace
        } else {
            SharingPolicy::ReplaceAsNeeded
        };
        let entry = self.ctx.registry.get_or_create(
            &resolved.cache_path,
            policy,
            self.ctx.freshness_for(resolved.volatile),
        );
        let status = entry.probe(refresh).await;
        debug!(
            "{} {} -> {} ({:?})",
            method, target, resolved.cache_path, status
        );

        if status == EntryStatus::Complete {
            self.ctx.metrics.record_cache_hit();
        } else {
            self.ctx.metrics.record_cache_miss();
        }
        if status == EntryStatus::Inited {
            let task = DownloadTask::new(
                entry.clone(),
                resolved.source,
                self.ctx.config.redirect_max,
            );
            let ctx = &self.ctx;
            let downloader = self
                .downloader
                .get_or_insert_with(|| Downloader::spawn(Arc::clone(ctx)));
            if let Err(e) = downloader.submit(task) {
                entry.fail(None, e);
            }
        }

        RequestJob::new(request, entry)
    }
}

/// Parse request headers off the socket until EOF or a protocol error
async fn read_requests(mut reader: OwnedReadHalf, tx: mpsc::Sender<Incoming>) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        loop {
            match HttpHeader::parse(&buf) {
                Ok(Some((request, used))) => {
                    buf.advance(used);
                    let checked = check_request(request);
                    let fatal = checked.is_err();
                    if tx.send(checked).await.is_err() || fatal {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Unparseable client input is the client's fault
                    let rejected = ProxyError::BadRequest(e.to_string());
                    if tx.send(Err(rejected)).await.is_err() {
                        debug!("Connection closed before rejecting bad request");
                    }
                    return;
                }
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// Requests must be bodiless request headers
fn check_request(header: HttpHeader) -> Result<HttpHeader> {
    if !matches!(header.kind(), MessageKind::Request { .. }) {
        return Err(ProxyError::BadRequest("expected a request line".to_string()));
    }
    if header.is_chunked() || header.content_length().is_some_and(|n| n > 0) {
        return Err(ProxyError::BadRequest("request bodies are not supported".to_string()));
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> HttpHeader {
        HttpHeader::parse(raw.as_bytes()).unwrap().unwrap().0
    }

    #[test]
    fn test_check_request() {
        assert!(check_request(parse("GET /debian/x HTTP/1.1\r\nHost: a\r\n\r\n")).is_ok());
        assert!(check_request(parse("HTTP/1.1 200 OK\r\n\r\n")).is_err());
        assert!(check_request(parse("POST /x HTTP/1.1\r\nContent-Length: 3\r\n\r\n")).is_err());
        assert!(check_request(parse("GET /x HTTP/1.1\r\nContent-Length: 0\r\n\r\n")).is_ok());
    }

    #[tokio::test]
    async fn test_reader_forwards_pipelined_requests() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"GET /a HTTP/1.1\r\n\r\nHEAD /b HTTP/1.1\r\n\r\nGARBAGE\r\n\r\n")
                .await
                .unwrap();
            s
        });
        let (server, _) = listener.accept().await.unwrap();
        let _client = client.await.unwrap();
        let (read_half, _write_half) = server.into_split();

        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(read_requests(read_half, tx));
        assert_eq!(rx.recv().await.unwrap().unwrap().target(), Some("/a"));
        assert_eq!(rx.recv().await.unwrap().unwrap().method(), Some(&Method::HEAD));
        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
        assert_eq!(err.to_http_status(), 400);
        assert!(rx.recv().await.is_none());
    }
}
