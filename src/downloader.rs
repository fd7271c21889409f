//! Upstream download agent
//!
//! Each client connection lazily gets one `Downloader`. It owns a queue of
//! download tasks, pipelines requests for the same upstream host over one
//! pooled connection and streams the response bodies into their cache
//! entries. Dropping the `Downloader` handle does not cancel queued work:
//! the agent finishes its queue and exits, so downloads for disconnected
//! clients still complete.

use crate::blacklist::BackendBlacklist;
use crate::cache_entry::BeginOutcome;
use crate::conn_pool::{PoolKey, UpstreamStream};
use crate::context::ProxyContext;
use crate::error::{ProxyError, Result};
use crate::header::{HeaderField, HttpHeader, HttpVersion};
use crate::path_classifier::DownloadSource;
use crate::registry::EntryHandle;
use crate::response_parser::{ParseEvent, ResponseParser};
use base64::Engine;
use bytes::BytesMut;
use http::Method;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

const READ_CHUNK: usize = 64 * 1024;

/// Resume restarts allowed per task before giving up
const MAX_RESTARTS: u32 = 2;

/// Retry policy for failed upstream connections
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries
    pub max_retries: usize,
    /// Backoff durations in milliseconds for each retry attempt
    pub backoff_ms: Vec<u64>,
}

impl RetryPolicy {
    /// Create a new retry policy with exponential backoff
    pub fn new(max_retries: usize) -> Self {
        // 100ms, 200ms, 400ms, ...
        let backoff_ms = (0..max_retries)
            .map(|i| 100 * 2u64.pow(i as u32))
            .collect();

        RetryPolicy {
            max_retries,
            backoff_ms,
        }
    }

    /// Check if we should retry based on the attempt number and error
    pub fn should_retry(&self, attempt: usize, error: &ProxyError) -> bool {
        attempt < self.max_retries && error.should_retry()
    }

    /// Get the backoff duration for a given attempt
    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        let ms = self
            .backoff_ms
            .get(attempt)
            .copied()
            .unwrap_or_else(|| *self.backoff_ms.last().unwrap_or(&1000));
        Duration::from_millis(ms)
    }
}

/// One resource to fetch into its cache entry
#[derive(Debug)]
pub struct DownloadTask {
    entry: EntryHandle,
    source: DownloadSource,
    redirects_left: u32,
    redirect_url: Option<Url>,
    backend_index: usize,
    attempts: usize,
    restarts: u32,
    last_error: Option<ProxyError>,
    counted: bool,
}

impl DownloadTask {
    /// # Arguments
    /// * `entry` - Entry the body is stored into
    /// * `source` - Where the resource can be fetched from
    /// * `redirect_max` - Redirects to follow before failing
    pub fn new(entry: EntryHandle, source: DownloadSource, redirect_max: u32) -> Self {
        DownloadTask {
            entry,
            source,
            redirects_left: redirect_max,
            redirect_url: None,
            backend_index: 0,
            attempts: 0,
            restarts: 0,
            last_error: None,
            counted: false,
        }
    }

    pub fn entry(&self) -> &EntryHandle {
        &self.entry
    }
}

/// Handle to a download agent
pub struct Downloader {
    id: u64,
    tx: mpsc::UnboundedSender<DownloadTask>,
}

impl Downloader {
    /// Start a new agent on the runtime
    pub fn spawn(ctx: Arc<ProxyContext>) -> Self {
        let id = ctx.next_agent_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = DownloadAgent::new(id, ctx, rx);
        tokio::spawn(agent.run());
        Downloader { id, tx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a task; safe to call from any task
    pub fn submit(&self, task: DownloadTask) -> Result<()> {
        self.tx.send(task).map_err(|_| ProxyError::Shutdown)
    }
}

/// Where one request is sent
#[derive(Debug, Clone)]
struct Endpoint {
    url: Url,
    key: PoolKey,
    backend: String,
    via_proxy: bool,
}

enum Prepared {
    Ready(Endpoint),
    Drop,
    Fail(ProxyError),
}

/// What to do with the body of the current response
#[derive(Debug)]
enum Disposition {
    Pending,
    Store,
    Discard,
    Redirect(Url),
    Failover(ProxyError),
    Restart,
    Abort,
}

struct InFlight {
    task: DownloadTask,
    endpoint: Endpoint,
    requested_from: Option<u64>,
    sent_at: Instant,
    disposition: Disposition,
    received_any: bool,
    /// Confirmed size when the request was sent
    resumed_at: u64,
}

/// Outcome of reading one response off a connection
enum ResponseEnd {
    Done { reusable: bool },
    Lost(ProxyError),
    Shutdown,
}

struct DownloadAgent {
    id: u64,
    ctx: Arc<ProxyContext>,
    rx: mpsc::UnboundedReceiver<DownloadTask>,
    queue: VecDeque<DownloadTask>,
    retry_policy: RetryPolicy,
    net_timeout: Duration,
    upstream_proxy: Option<Url>,
}

impl DownloadAgent {
    fn new(id: u64, ctx: Arc<ProxyContext>, rx: mpsc::UnboundedReceiver<DownloadTask>) -> Self {
        let upstream_proxy = ctx.config.upstream_proxy_url();
        DownloadAgent {
            id,
            retry_policy: RetryPolicy::new(ctx.config.max_retries),
            net_timeout: ctx.config.network_timeout(),
            upstream_proxy,
            ctx,
            rx,
            queue: VecDeque::new(),
        }
    }

    async fn run(mut self) {
        debug!("Downloader {} started", self.id);
        loop {
            if self.queue.is_empty() {
                let ctx = Arc::clone(&self.ctx);
                tokio::select! {
                    task = self.rx.recv() => match task {
                        Some(task) => self.queue.push_back(task),
                        None => break,
                    },
                    _ = ctx.wait_shutdown() => {}
                }
            }
            while let Ok(task) = self.rx.try_recv() {
                self.queue.push_back(task);
            }
            if self.ctx.is_shutting_down() {
                self.stop_all();
                break;
            }

            self.clean_queue();
            let Some(batch) = self.next_batch() else {
                continue;
            };
            self.run_batch(batch).await;
        }
        debug!("Downloader {} finished", self.id);
    }

    fn stop_all(&mut self) {
        for task in self.queue.drain(..) {
            task.entry.stop();
        }
        self.rx.close();
        while let Ok(task) = self.rx.try_recv() {
            task.entry.stop();
        }
    }

    /// Drop tasks whose entries are served elsewhere or already finished
    fn clean_queue(&mut self) {
        let id = self.id;
        let metrics = Arc::clone(&self.ctx.metrics);
        let mut kept: Vec<DownloadTask> = Vec::with_capacity(self.queue.len());
        for task in self.queue.drain(..) {
            let usable = task.entry.is_owned_by(id)
                || task.entry.status() == crate::cache_entry::EntryStatus::Inited;
            let duplicate = kept.iter().any(|k| k.entry.same_entry(&task.entry));
            if usable && !duplicate {
                kept.push(task);
            } else {
                debug!(
                    "Downloader {} dropping task for {} ({:?})",
                    id,
                    task.entry.path(),
                    task.entry.status()
                );
                if !usable {
                    metrics.record_pipeline_collision();
                }
            }
        }
        self.queue = kept.into();
    }

    /// Claim the task's entry and pick the URL to request
    fn prepare(&self, task: &mut DownloadTask) -> Prepared {
        if !task.entry.try_assign(self.id) {
            return Prepared::Drop;
        }
        if !task.counted {
            task.counted = true;
            self.ctx.metrics.record_download_started();
        }

        if let Some(url) = task.redirect_url.clone() {
            return match self.endpoint_for(url) {
                Ok(endpoint) => Prepared::Ready(endpoint),
                Err(e) => Prepared::Fail(e),
            };
        }

        while task.backend_index < task.source.backend_count() {
            let url = match task.source.url_for(task.backend_index) {
                Some(url) => url,
                None => {
                    task.backend_index += 1;
                    continue;
                }
            };
            let endpoint = match self.endpoint_for(url) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    task.last_error = Some(e);
                    task.backend_index += 1;
                    continue;
                }
            };
            if let Some(reason) = self.ctx.blacklist.blocked_reason(&endpoint.backend) {
                debug!("Skipping blacklisted backend {}", endpoint.backend);
                task.last_error.get_or_insert_with(|| {
                    ProxyError::ConnectFailed(format!("{} is blacklisted: {}", endpoint.backend, reason))
                });
                task.backend_index += 1;
                continue;
            }
            return Prepared::Ready(endpoint);
        }

        Prepared::Fail(
            task.last_error
                .take()
                .unwrap_or_else(|| ProxyError::BackendsExhausted(task.entry.path().to_string())),
        )
    }

    fn endpoint_for(&self, url: Url) -> Result<Endpoint> {
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::BadRequest(format!("no host in {}", url)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProxyError::BadRequest(format!("no port for {}", url)))?;
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(ProxyError::BadRequest(format!("unsupported scheme {}", other))),
        };
        let backend = BackendBlacklist::key(&host, port);

        // Plain HTTP goes through the upstream proxy; TLS connects directly
        let (key, via_proxy) = match (&self.upstream_proxy, tls) {
            (Some(proxy), false) => {
                let proxy_host = proxy.host_str().unwrap_or_default().to_string();
                let proxy_port = proxy.port_or_known_default().unwrap_or(3128);
                (PoolKey::new(proxy_host, proxy_port, false), true)
            }
            _ => (PoolKey::new(host, port, tls), false),
        };

        Ok(Endpoint {
            url,
            key,
            backend,
            via_proxy,
        })
    }

    /// Take the head of the queue plus following tasks for the same host
    fn next_batch(&mut self) -> Option<Vec<(DownloadTask, Endpoint)>> {
        let depth = self.ctx.config.pipeline_depth.max(1);
        let mut batch: Vec<(DownloadTask, Endpoint)> = Vec::new();

        while batch.len() < depth {
            let Some(mut task) = self.queue.pop_front() else {
                break;
            };
            if batch.iter().any(|(t, _)| t.entry.same_entry(&task.entry)) {
                continue;
            }
            match self.prepare(&mut task) {
                Prepared::Ready(endpoint) => {
                    let same_host = batch
                        .first()
                        .map_or(true, |(_, first)| first.key == endpoint.key);
                    if same_host {
                        batch.push((task, endpoint));
                    } else {
                        self.queue.push_front(task);
                        break;
                    }
                }
                Prepared::Drop => {
                    debug!("Entry {} taken by another agent", task.entry.path());
                    self.ctx.metrics.record_pipeline_collision();
                }
                Prepared::Fail(e) => self.fail_task(task, e),
            }
        }

        (!batch.is_empty()).then_some(batch)
    }

    fn fail_task(&self, task: DownloadTask, err: ProxyError) {
        warn!("Download of {} failed: {}", task.entry.path(), err);
        self.ctx.metrics.record_download_finished(false);
        task.entry.fail(Some(self.id), err);
    }

    /// Build the upstream GET for a task
    ///
    /// # Returns
    /// The serialized request and the first requested byte for resumes
    fn build_request(&self, task: &DownloadTask, endpoint: &Endpoint) -> (Vec<u8>, Option<u64>) {
        let url = &endpoint.url;
        let target = if endpoint.via_proxy {
            url.as_str().to_string()
        } else {
            match url.query() {
                Some(q) => format!("{}?{}", url.path(), q),
                None => url.path().to_string(),
            }
        };

        let mut req = HttpHeader::request(Method::GET, target, HttpVersion::Http11);
        let host = url.host_str().unwrap_or_default();
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        req.set(HeaderField::Host, host);
        req.set(HeaderField::Connection, "keep-alive");
        req.set_extra("User-Agent", self.ctx.config.user_agent.clone());
        req.set_extra("Accept", "*/*");

        if !url.username().is_empty() {
            let credentials = format!("{}:{}", url.username(), url.password().unwrap_or(""));
            let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
            req.set(HeaderField::Authorization, format!("Basic {}", encoded));
        }

        let resume = task.entry.resume_point();
        let mut requested_from = None;
        if let Some(start) = resume.range_start() {
            req.set(HeaderField::Range, format!("bytes={}-", start));
            if let Some(lm) = &resume.last_modified {
                req.set(HeaderField::IfRange, lm.clone());
            }
            requested_from = Some(start);
        } else if resume.whole {
            if let Some(lm) = &resume.last_modified {
                req.set(HeaderField::IfModifiedSince, lm.clone());
            }
        }

        (req.to_bytes(), requested_from)
    }

    async fn run_batch(&mut self, batch: Vec<(DownloadTask, Endpoint)>) {
        let key = batch[0].1.key.clone();
        let mut stream = match self.connect(&key).await {
            Ok(stream) => stream,
            Err(e) => {
                for (task, endpoint) in batch.into_iter().rev() {
                    self.on_failure(task, &endpoint, e.clone(), true).await;
                }
                return;
            }
        };
        let reused = stream.is_reused();

        let mut inflight: VecDeque<InFlight> = VecDeque::with_capacity(batch.len());
        let mut requests = Vec::new();
        for (task, endpoint) in batch {
            let (bytes, requested_from) = self.build_request(&task, &endpoint);
            debug!(
                "Downloader {} requesting {} (from {:?})",
                self.id, endpoint.url, requested_from
            );
            requests.extend_from_slice(&bytes);
            self.ctx.upstream_metrics.record_request(&endpoint.backend);
            let resumed_at = task.entry.confirmed_size();
            inflight.push_back(InFlight {
                task,
                endpoint,
                requested_from,
                sent_at: Instant::now(),
                disposition: Disposition::Pending,
                received_any: false,
                resumed_at,
            });
        }

        let written = match timeout(self.net_timeout, stream.write_all(&requests)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProxyError::from(e)),
            Err(_) => Err(ProxyError::Timeout("writing upstream request".to_string())),
        };
        if let Err(e) = written {
            self.on_connection_lost(inflight, e, reused).await;
            return;
        }

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut first = true;
        while let Some(mut flight) = inflight.pop_front() {
            let end = self.receive_response(&mut stream, &mut buf, &mut flight).await;
            match end {
                ResponseEnd::Done { reusable } => {
                    self.settle(flight).await;
                    if !reusable {
                        self.requeue_unanswered(inflight);
                        return;
                    }
                }
                ResponseEnd::Lost(e) => {
                    let stale = reused && first && !flight.received_any;
                    inflight.push_front(flight);
                    self.on_connection_lost(inflight, e, stale).await;
                    return;
                }
                ResponseEnd::Shutdown => {
                    flight.task.entry.stop();
                    for rest in inflight {
                        rest.task.entry.stop();
                    }
                    return;
                }
            }
            first = false;
        }

        self.ctx.pool.release(stream);
    }

    async fn connect(&self, key: &PoolKey) -> Result<UpstreamStream> {
        let ctx = Arc::clone(&self.ctx);
        tokio::select! {
            stream = ctx.pool.acquire(key) => stream,
            _ = ctx.wait_shutdown() => Err(ProxyError::Shutdown),
        }
    }

    /// Read and dispatch one response
    async fn receive_response(
        &self,
        stream: &mut UpstreamStream,
        buf: &mut BytesMut,
        flight: &mut InFlight,
    ) -> ResponseEnd {
        let mut parser = ResponseParser::new(false);
        loop {
            let event = match parser.step(buf) {
                Ok(event) => event,
                Err(e) => return ResponseEnd::Lost(e),
            };
            match event {
                ParseEvent::NeedMore => {
                    buf.reserve(READ_CHUNK);
                    let read = tokio::select! {
                        read = timeout(self.net_timeout, stream.read_buf(buf)) => read,
                        _ = self.ctx.wait_shutdown() => return ResponseEnd::Shutdown,
                    };
                    let n = match read {
                        Ok(Ok(n)) => n,
                        Ok(Err(e)) => return ResponseEnd::Lost(e.into()),
                        Err(_) => {
                            return ResponseEnd::Lost(ProxyError::Timeout(format!(
                                "no data from {} within {:?}",
                                flight.endpoint.backend, self.net_timeout
                            )))
                        }
                    };
                    if n == 0 {
                        match parser.on_eof() {
                            Ok(ParseEvent::Finished) => {
                                self.finish_body(flight).await;
                                return ResponseEnd::Done { reusable: false };
                            }
                            Ok(_) => {}
                            Err(e) => return ResponseEnd::Lost(e),
                        }
                    }
                }
                ParseEvent::Header(header) => {
                    flight.received_any = true;
                    flight.disposition = self.dispatch_header(flight, &header).await;
                }
                ParseEvent::Data(data) => {
                    flight.received_any = true;
                    self.ctx
                        .upstream_metrics
                        .record_bytes(&flight.endpoint.backend, data.len() as u64);
                    self.ctx.metrics.record_bytes_from_upstream(data.len() as u64);
                    if matches!(flight.disposition, Disposition::Store) {
                        self.store_data(flight, &data).await;
                        if matches!(flight.disposition, Disposition::Abort) {
                            return ResponseEnd::Done { reusable: false };
                        }
                    }
                }
                ParseEvent::Finished => {
                    self.finish_body(flight).await;
                    return ResponseEnd::Done {
                        reusable: parser.reusable(),
                    };
                }
            }
        }
    }

    /// Decide how to handle a response from its header
    async fn dispatch_header(&self, flight: &mut InFlight, header: &HttpHeader) -> Disposition {
        let status = header.status().unwrap_or(0);
        let backend = flight.endpoint.backend.clone();
        self.ctx.upstream_metrics.record_response(
            &backend,
            status,
            flight.sent_at.elapsed().as_secs_f64(),
        );
        debug!("{} answered {} for {}", backend, status, flight.task.entry.path());

        if matches!(status, 301 | 302 | 303 | 307 | 308) {
            if let Some(location) = header.get(HeaderField::Location) {
                return match flight.endpoint.url.join(location) {
                    Ok(url) => Disposition::Redirect(url),
                    Err(e) => Disposition::Failover(ProxyError::ProtocolError(format!(
                        "bad redirect target {}: {}",
                        location, e
                    ))),
                };
            }
        }

        let mirrors_left =
            flight.task.backend_index + 1 < flight.task.source.backend_count();
        if mirrors_left && status >= 400 {
            let err = ProxyError::from_http_status(status, header.reason().unwrap_or_default());
            if err.should_failover() || flight.task.source.is_marker() {
                return Disposition::Failover(err);
            }
        }

        let source = flight.endpoint.url.to_string();
        match flight
            .task
            .entry
            .begin_download(self.id, header, flight.requested_from, &source)
            .await
        {
            Ok(BeginOutcome::Accepted) => {
                if status < 400 {
                    self.ctx.blacklist.unblock(&backend);
                }
                Disposition::Store
            }
            Ok(BeginOutcome::Confirmed) => {
                self.ctx.metrics.record_download_finished(true);
                Disposition::Discard
            }
            Ok(BeginOutcome::Failed) => {
                self.ctx.metrics.record_download_finished(false);
                Disposition::Discard
            }
            Ok(BeginOutcome::Restart) => Disposition::Restart,
            Ok(BeginOutcome::Rejected) => {
                self.ctx.metrics.record_pipeline_collision();
                Disposition::Discard
            }
            Err(e) => {
                warn!("Cannot store {}: {}", flight.task.entry.path(), e);
                self.ctx.metrics.record_download_finished(false);
                Disposition::Abort
            }
        }
    }

    async fn store_data(&self, flight: &mut InFlight, data: &[u8]) {
        match flight.task.entry.append_body(self.id, data).await {
            Ok(()) => {}
            Err(ProxyError::ResumeMismatch(path)) => {
                info!("Cached prefix of {} changed upstream, restarting", path);
                flight.disposition = Disposition::Restart;
            }
            Err(ProxyError::Collision(path)) => {
                debug!("Lost ownership of {}", path);
                flight.disposition = Disposition::Discard;
            }
            Err(e) => {
                warn!("Storing {} failed: {}", flight.task.entry.path(), e);
                self.ctx.metrics.record_download_finished(false);
                flight.disposition = Disposition::Abort;
            }
        }
    }

    /// End of body for a stored response
    async fn finish_body(&self, flight: &mut InFlight) {
        if !matches!(flight.disposition, Disposition::Store) {
            return;
        }
        match flight.task.entry.append_body(self.id, &[]).await {
            Ok(()) => {
                self.ctx.metrics.record_download_finished(true);
                flight.disposition = Disposition::Discard;
            }
            Err(ProxyError::ProtocolError(msg)) => {
                // Body shorter than announced; resume from what was stored
                warn!("Truncated body: {}", msg);
                flight.disposition =
                    Disposition::Failover(ProxyError::ConnectionLost(msg));
            }
            Err(ProxyError::Collision(_)) => flight.disposition = Disposition::Discard,
            Err(e) => {
                warn!("Finishing {} failed: {}", flight.task.entry.path(), e);
                self.ctx.metrics.record_download_finished(false);
                flight.disposition = Disposition::Discard;
            }
        }
    }

    /// Apply the final disposition of a fully read response
    async fn settle(&mut self, flight: InFlight) {
        let InFlight {
            mut task,
            endpoint,
            disposition,
            ..
        } = flight;
        match disposition {
            Disposition::Pending | Disposition::Discard | Disposition::Abort => {}
            Disposition::Store => {
                // Aborted mid-body by a connection-level decision
                self.requeue_resumed(task);
            }
            Disposition::Redirect(url) => {
                if task.redirects_left == 0 {
                    self.fail_task(task, ProxyError::RedirectLoop);
                    return;
                }
                info!("Redirecting {} to {}", task.entry.path(), url);
                self.ctx.metrics.record_redirect();
                task.redirects_left -= 1;
                task.redirect_url = Some(url);
                task.entry.rewind(self.id);
                self.queue.push_front(task);
            }
            Disposition::Restart => {
                task.restarts += 1;
                self.ctx.metrics.record_resume_restart();
                if task.restarts > MAX_RESTARTS {
                    self.fail_task(
                        task,
                        ProxyError::ResumeMismatch("upstream keeps changing".to_string()),
                    );
                    return;
                }
                task.entry.rewind(self.id);
                self.queue.push_front(task);
            }
            Disposition::Failover(err) => {
                task.entry.rewind(self.id);
                if err.should_retry() && !matches!(err, ProxyError::UpstreamStatus { .. }) {
                    self.on_failure(task, &endpoint, err, false).await;
                } else {
                    self.failover(task, &endpoint, err);
                }
            }
        }
    }

    /// Connection dropped with requests outstanding
    ///
    /// The first task takes the blame unless the connection was a stale
    /// pooled one that never answered; the rest are requeued as they were.
    async fn on_connection_lost(&mut self, mut inflight: VecDeque<InFlight>, err: ProxyError, stale: bool) {
        let Some(first) = inflight.pop_front() else {
            return;
        };
        self.requeue_unanswered(inflight);

        self.ctx
            .upstream_metrics
            .record_error(&first.endpoint.backend, error_kind(&err));
        first.task.entry.rewind(self.id);
        if stale {
            debug!("Pooled connection to {} went stale, retrying", first.endpoint.key);
            self.queue.push_front(first.task);
            return;
        }
        // The probe byte is not progress; only newly confirmed bytes are
        if first.task.entry.confirmed_size() > first.resumed_at {
            self.requeue_resumed(first.task);
            return;
        }
        self.on_failure(first.task, &first.endpoint, err, true).await;
    }

    /// Retry the task on the same backend or move on to the next one
    async fn on_failure(&mut self, mut task: DownloadTask, endpoint: &Endpoint, err: ProxyError, record: bool) {
        if matches!(err, ProxyError::Shutdown) {
            task.entry.stop();
            return;
        }
        if record {
            self.ctx
                .upstream_metrics
                .record_error(&endpoint.backend, error_kind(&err));
        }
        task.entry.rewind(self.id);
        if self.retry_policy.should_retry(task.attempts, &err) {
            let backoff = self.retry_policy.backoff_duration(task.attempts);
            task.attempts += 1;
            debug!(
                "Retrying {} after {:?} (attempt {}): {}",
                task.entry.path(),
                backoff,
                task.attempts,
                err
            );
            let ctx = Arc::clone(&self.ctx);
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = ctx.wait_shutdown() => {}
            }
            self.queue.push_front(task);
            return;
        }
        if err.should_failover() {
            self.failover(task, endpoint, err);
        } else {
            self.fail_task(task, err);
        }
    }

    /// Blacklist the backend and continue with the next mirror
    fn failover(&mut self, mut task: DownloadTask, endpoint: &Endpoint, err: ProxyError) {
        self.ctx.blacklist.block(&endpoint.backend, &err.to_string());
        task.redirect_url = None;
        task.attempts = 0;
        task.backend_index += 1;
        task.last_error = Some(err.clone());

        if task.backend_index < task.source.backend_count() {
            info!(
                "Failing over {} to backend #{}",
                task.entry.path(),
                task.backend_index
            );
            self.ctx.metrics.record_failover();
            self.queue.push_front(task);
        } else {
            self.fail_task(task, err);
        }
    }

    fn requeue_resumed(&mut self, task: DownloadTask) {
        task.entry.rewind(self.id);
        self.queue.push_front(task);
    }

    /// Put tasks that never got an answer back in order
    fn requeue_unanswered(&mut self, inflight: VecDeque<InFlight>) {
        for flight in inflight.into_iter().rev() {
            flight.task.entry.rewind(self.id);
            self.queue.push_front(flight.task);
        }
    }
}

fn error_kind(err: &ProxyError) -> &'static str {
    match err {
        ProxyError::ConnectFailed(_) => "connect",
        ProxyError::Timeout(_) => "timeout",
        ProxyError::ProtocolError(_) => "protocol",
        _ => "lost",
    }
}
