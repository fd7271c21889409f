//! Per-request serving state machine
//!
//! A `RequestJob` streams one response to the client from a cache entry
//! that may still be downloading. It never sends past the confirmed size
//! it read from the entry, and it suspends whenever it has caught up with
//! an unfinished download.

use crate::cache_entry::{EntrySnapshot, EntryStatus, EntryWatcher};
use crate::error::ProxyError;
use crate::header::{parse_http_date, HeaderField, HttpHeader, HttpVersion};
use crate::models::RangeRequest;
use crate::registry::EntryHandle;
use crate::sink::{ClientSink, FILE_CHUNK};
use std::fs::File;
use std::sync::Arc;
use tracing::{debug, warn};

/// Serving state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for the entry to get a usable header
    WaitDlStart,
    SendMainHead,
    HeaderSent,
    SendPlainData,
    SendChunkHeader,
    SendChunkData,
    FinishJob,
    FatalError,
}

/// What the connection should do after one `advance` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Progress was made; call again
    CanSend,
    /// Caught up with the download; wait for the entry to change
    WaitForDownload,
    /// The response cannot be completed; close the connection
    Disconnect,
    /// Response fully sent
    Finished,
}

/// Body framing on the client side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Length,
    Chunked,
    UntilClose,
}

/// Main header and body window for one response
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsePlan {
    pub header: HttpHeader,
    /// First data file offset to send
    pub start: u64,
    /// Exclusive end of the window, if known
    pub end: Option<u64>,
    pub framing: Framing,
    pub has_body: bool,
}

/// Headers copied from the stored upstream header
const RELAYED_FIELDS: [HeaderField; 3] = [
    HeaderField::ContentType,
    HeaderField::LastModified,
    HeaderField::XOriginalSource,
];

/// Choose status, headers and body window for a client request
///
/// `snapshot` must describe an entry whose header was accepted, i.e. its
/// status is at least `DlGotHead` or it failed.
pub fn plan_response(request: &HttpHeader, snapshot: &EntrySnapshot) -> ResponsePlan {
    let version = request.version();
    let keep_alive = request.keep_alive();
    let head_only = request.method().is_some_and(|m| *m == http::Method::HEAD);

    let stored = match (&snapshot.header, snapshot.status.is_failed()) {
        (Some(h), false) => h,
        _ => {
            let err = snapshot
                .error
                .clone()
                .unwrap_or_else(|| ProxyError::InternalError("no header".to_string()));
            return error_plan(&err, version, keep_alive);
        }
    };

    let last_modified = stored.get(HeaderField::LastModified);
    let total = snapshot.total;
    let answer = |status: u16| {
        let mut h = HttpHeader::answer_for(status);
        h.set_version(version);
        for field in RELAYED_FIELDS {
            if let Some(v) = stored.get(field) {
                h.set(field, v);
            }
        }
        h
    };

    // If-Range that does not match the stored validator disables the range
    let if_range_ok = match (request.get(HeaderField::IfRange), last_modified) {
        (None, _) => true,
        (Some(ir), Some(lm)) => ir.trim() == lm.trim(),
        (Some(_), None) => false,
    };
    let range = request
        .get(HeaderField::Range)
        .filter(|_| if_range_ok)
        .and_then(|r| RangeRequest::parse(r).ok());

    if range.is_none() && not_modified(request, last_modified) {
        let mut h = answer(304);
        h.remove(HeaderField::ContentType);
        return finalize(h, 0, Some(0), Framing::Length, false, keep_alive);
    }

    if let (Some(range), Some(total)) = (&range, total) {
        return match range.resolve(total) {
            Some(window) => {
                let mut h = answer(206);
                h.set(HeaderField::ContentRange, window.to_content_range(total));
                h.set(HeaderField::ContentLength, window.size().to_string());
                finalize(
                    h,
                    window.start,
                    Some(window.end_exclusive()),
                    Framing::Length,
                    !head_only,
                    keep_alive,
                )
            }
            None => {
                let mut h = answer(416);
                h.remove(HeaderField::ContentType);
                h.set(HeaderField::ContentRange, format!("bytes */{}", total));
                h.set(HeaderField::ContentLength, "0");
                finalize(h, 0, Some(0), Framing::Length, false, keep_alive)
            }
        };
    }

    let mut h = answer(200);
    match total {
        Some(total) => {
            h.set(HeaderField::ContentLength, total.to_string());
            finalize(h, 0, Some(total), Framing::Length, !head_only, keep_alive)
        }
        None if version >= HttpVersion::Http11 => {
            if !head_only {
                h.set(HeaderField::TransferEncoding, "chunked");
            }
            finalize(h, 0, None, Framing::Chunked, !head_only, keep_alive)
        }
        None => finalize(h, 0, None, Framing::UntilClose, !head_only, false),
    }
}

fn not_modified(request: &HttpHeader, last_modified: Option<&str>) -> bool {
    let Some(lm) = last_modified.and_then(parse_http_date) else {
        return false;
    };
    if let Some(ims) = request
        .get(HeaderField::IfModifiedSince)
        .and_then(parse_http_date)
    {
        return ims >= lm;
    }
    request
        .get(HeaderField::IfRange)
        .and_then(parse_http_date)
        .is_some_and(|ir| ir == lm)
}

fn finalize(
    mut header: HttpHeader,
    start: u64,
    end: Option<u64>,
    framing: Framing,
    has_body: bool,
    keep_alive: bool,
) -> ResponsePlan {
    let keep_alive = keep_alive && framing != Framing::UntilClose;
    header.set(
        HeaderField::Connection,
        if keep_alive { "keep-alive" } else { "close" },
    );
    ResponsePlan {
        header,
        start,
        end,
        framing,
        has_body,
    }
}

/// Minimal response for a failed request
pub fn error_plan(err: &ProxyError, version: HttpVersion, keep_alive: bool) -> ResponsePlan {
    let mut header = HttpHeader::answer(err.to_http_status(), err.status_message());
    header.set_version(version);
    header.set(HeaderField::ContentLength, "0");
    finalize(header, 0, Some(0), Framing::Length, false, keep_alive)
}

/// One client request being served
pub struct RequestJob {
    request: HttpHeader,
    entry: Option<EntryHandle>,
    watcher: Option<EntryWatcher>,
    state: JobState,
    error: Option<ProxyError>,
    plan: Option<ResponsePlan>,
    cursor: u64,
    chunk_left: u64,
    generation: u64,
    file: Option<Arc<File>>,
    sent_any: bool,
    bytes_sent: u64,
}

impl RequestJob {
    /// Serve `request` from `entry`
    ///
    /// The job subscribes to the entry immediately so no change made after
    /// creation is missed.
    pub fn new(request: HttpHeader, entry: EntryHandle) -> Self {
        let watcher = entry.subscribe();
        RequestJob {
            request,
            entry: Some(entry),
            watcher: Some(watcher),
            state: JobState::WaitDlStart,
            error: None,
            plan: None,
            cursor: 0,
            chunk_left: 0,
            generation: 0,
            file: None,
            sent_any: false,
            bytes_sent: 0,
        }
    }

    /// A job that only answers with the error status
    pub fn rejected(request: HttpHeader, err: ProxyError) -> Self {
        RequestJob {
            request,
            entry: None,
            watcher: None,
            state: JobState::FatalError,
            error: Some(err),
            plan: None,
            cursor: 0,
            chunk_left: 0,
            generation: 0,
            file: None,
            sent_any: false,
            bytes_sent: 0,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn request(&self) -> &HttpHeader {
        &self.request
    }

    pub fn entry(&self) -> Option<&EntryHandle> {
        self.entry.as_ref()
    }

    /// Body bytes written so far
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Whether the connection may carry another response after this one
    pub fn keep_alive(&self) -> bool {
        match &self.plan {
            Some(plan) => plan.header.keep_alive(),
            None => self.request.keep_alive(),
        }
    }

    /// Wait for the next entry change
    pub async fn wait(&mut self) {
        match self.watcher.as_mut() {
            Some(watcher) => watcher.changed().await,
            None => std::future::pending().await,
        }
    }

    /// Run the state machine until it sends something, blocks or ends
    pub async fn advance<S: ClientSink + ?Sized>(&mut self, sink: &mut S) -> Advance {
        match self.step(sink).await {
            Ok(advance) => advance,
            Err(e) => {
                debug!("Client write failed: {}", e);
                Advance::Disconnect
            }
        }
    }

    async fn step<S: ClientSink + ?Sized>(&mut self, sink: &mut S) -> Result<Advance, ProxyError> {
        loop {
            match self.state {
                JobState::WaitDlStart => {
                    let Some(entry) = self.entry.as_ref() else {
                        self.state = JobState::FatalError;
                        continue;
                    };
                    let snapshot = entry.snapshot();
                    if snapshot.status.is_failed() {
                        self.error = snapshot.error.clone();
                        self.state = JobState::FatalError;
                        continue;
                    }
                    if snapshot.status < EntryStatus::DlGotHead || snapshot.probe_pending {
                        return Ok(Advance::WaitForDownload);
                    }
                    let plan = plan_response(&self.request, &snapshot);
                    // Bind the data file now; opening it later could pick up
                    // a replacement written at the same path
                    self.file = match entry.reader() {
                        Some((file, generation)) if generation == snapshot.generation => Some(file),
                        Some(_) => continue,
                        None => None,
                    };
                    debug!(
                        "Serving {} with {} ({}..{:?})",
                        entry.path(),
                        plan.header.status().unwrap_or(0),
                        plan.start,
                        plan.end
                    );
                    self.generation = snapshot.generation;
                    self.cursor = plan.start;
                    self.plan = Some(plan);
                    self.state = JobState::SendMainHead;
                }
                JobState::SendMainHead => {
                    let Some(plan) = self.plan.as_ref() else {
                        self.state = JobState::FatalError;
                        continue;
                    };
                    sink.send_bytes(&plan.header.to_bytes()).await?;
                    self.sent_any = true;
                    self.state = JobState::HeaderSent;
                    return Ok(Advance::CanSend);
                }
                JobState::HeaderSent => {
                    self.state = match self.plan.as_ref() {
                        Some(plan) if plan.has_body => match plan.framing {
                            Framing::Chunked => JobState::SendChunkHeader,
                            Framing::Length | Framing::UntilClose => JobState::SendPlainData,
                        },
                        _ => JobState::FinishJob,
                    };
                }
                JobState::SendPlainData | JobState::SendChunkHeader => {
                    let chunked = self.state == JobState::SendChunkHeader;
                    match self.available()? {
                        Available::Bytes(n) if chunked => {
                            let n = n.min(FILE_CHUNK);
                            sink.send_bytes(format!("{:x}\r\n", n).as_bytes()).await?;
                            self.chunk_left = n;
                            self.state = JobState::SendChunkData;
                        }
                        Available::Bytes(n) => {
                            self.send_data(sink, n).await?;
                            return Ok(Advance::CanSend);
                        }
                        Available::Wait => return Ok(Advance::WaitForDownload),
                        Available::End => {
                            if chunked {
                                sink.send_bytes(b"0\r\n\r\n").await?;
                            }
                            self.state = JobState::FinishJob;
                        }
                        Available::Broken => return Ok(Advance::Disconnect),
                    }
                }
                JobState::SendChunkData => {
                    if self.chunk_left == 0 {
                        sink.send_bytes(b"\r\n").await?;
                        self.state = JobState::SendChunkHeader;
                        continue;
                    }
                    let sent = self.send_data(sink, self.chunk_left).await?;
                    self.chunk_left -= sent;
                    return Ok(Advance::CanSend);
                }
                JobState::FinishJob => {
                    sink.flush().await?;
                    return Ok(Advance::Finished);
                }
                JobState::FatalError => {
                    if self.sent_any {
                        return Ok(Advance::Disconnect);
                    }
                    let err = self
                        .error
                        .clone()
                        .unwrap_or_else(|| ProxyError::InternalError("request failed".to_string()));
                    let plan = error_plan(&err, self.request.version(), self.request.keep_alive());
                    sink.send_bytes(&plan.header.to_bytes()).await?;
                    self.sent_any = true;
                    self.plan = Some(plan);
                    self.state = JobState::FinishJob;
                }
            }
        }
    }

    /// How much may be sent now, re-read from the entry
    fn available(&self) -> Result<Available, ProxyError> {
        let (Some(entry), Some(plan)) = (self.entry.as_ref(), self.plan.as_ref()) else {
            return Ok(Available::Broken);
        };
        let snapshot = entry.snapshot();
        if snapshot.generation != self.generation {
            warn!("{} was replaced while being served", entry.path());
            return Ok(Available::Broken);
        }
        if snapshot.status.is_failed() {
            debug!("Download of {} failed mid-response", entry.path());
            return Ok(Available::Broken);
        }
        if snapshot.probe_pending {
            return Ok(Available::Wait);
        }

        let ceiling = match plan.end {
            Some(end) => end.min(snapshot.confirmed),
            None => snapshot.confirmed,
        };
        if self.cursor < ceiling {
            return Ok(Available::Bytes(ceiling - self.cursor));
        }
        if plan.end.is_some_and(|end| self.cursor >= end) {
            return Ok(Available::End);
        }
        if snapshot.status == EntryStatus::Complete {
            return Ok(if plan.end.is_none() {
                Available::End
            } else {
                // Complete but shorter than the promised window
                Available::Broken
            });
        }
        Ok(Available::Wait)
    }

    async fn send_data<S: ClientSink + ?Sized>(&mut self, sink: &mut S, len: u64) -> Result<u64, ProxyError> {
        let entry = self
            .entry
            .as_ref()
            .ok_or_else(|| ProxyError::InternalError("no entry".to_string()))?;
        if entry.generation() != self.generation {
            return Err(ProxyError::Collision(entry.path().to_string()));
        }
        let file = match self.file.as_ref() {
            Some(file) => Arc::clone(file),
            None => {
                return Err(ProxyError::StorageError(format!(
                    "no cached data for {}",
                    entry.path()
                )))
            }
        };
        let sent = sink.send_file(file, self.cursor, len).await?;
        if sent == 0 {
            return Err(ProxyError::StorageError(
                "cached data shorter than confirmed size".to_string(),
            ));
        }
        self.cursor += sent;
        self.bytes_sent += sent;
        Ok(sent)
    }
}

enum Available {
    Bytes(u64),
    Wait,
    End,
    Broken,
}
