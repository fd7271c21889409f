//! Shared cache entry
//!
//! One `CacheEntry` represents one cached resource: the data file at `P`,
//! its header sidecar at `P.head`, and the in-memory download state. The
//! single downloader that owns an entry writes into it; any number of
//! request jobs read from it and are woken through a watch channel whenever
//! the state changes.
//!
//! The confirmed size only covers bytes that were written and flushed, and
//! it never shrinks except through an explicit storage restart, which bumps
//! the entry generation so readers can tell their bytes are stale.

use crate::error::{ProxyError, Result};
use crate::header::{HeaderField, HttpHeader};
use crate::models::ContentRange;
use std::fs::File;
use std::io::{ErrorKind, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Entry life-cycle
///
/// Ordered so that everything below `Complete` is still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryStatus {
    /// Created, disk state not inspected yet
    Fresh,
    /// Disk state known, no downloader attached
    Inited,
    /// A downloader owns the entry and is about to request it
    DlAssigned,
    /// The upstream header was accepted
    DlGotHead,
    /// Body bytes are arriving
    DlReceiving,
    /// Data and sidecar are whole and valid
    Complete,
    /// Failed; the stored header describes the error
    DlError,
    /// Download interrupted by shutdown
    DlStop,
}

impl EntryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntryStatus::Complete | EntryStatus::DlError | EntryStatus::DlStop
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(self, EntryStatus::DlError | EntryStatus::DlStop)
    }

    /// Whether a downloader currently owns the entry
    pub fn is_downloading(self) -> bool {
        matches!(
            self,
            EntryStatus::DlAssigned | EntryStatus::DlGotHead | EntryStatus::DlReceiving
        )
    }
}

/// Result of handing an upstream response header to the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// The body must be stored through `append_body`
    Accepted,
    /// A 304 confirmed the cached file; the body is discarded
    Confirmed,
    /// Cached prefix is unusable; download again from offset zero
    Restart,
    /// A terminal error header was stored; the body is discarded
    Failed,
    /// Another agent owns or finished the entry; the body is discarded
    Rejected,
}

/// Point-in-time view of an entry
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub status: EntryStatus,
    pub confirmed: u64,
    pub total: Option<u64>,
    pub header: Option<HttpHeader>,
    pub generation: u64,
    pub error: Option<ProxyError>,
    /// A resumed download has not yet checked its probe byte; the cached
    /// prefix must not be served until it has
    pub probe_pending: bool,
}

/// How a download should continue from the cached state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    /// Bytes already cached
    pub confirmed: u64,
    /// Whether the cached bytes form the whole file
    pub whole: bool,
    /// Validator from the stored header
    pub last_modified: Option<String>,
}

impl ResumePoint {
    /// First byte to request for a ranged resume, which is the probe byte
    pub fn range_start(&self) -> Option<u64> {
        if self.confirmed > 0 && !self.whole {
            Some(self.confirmed - 1)
        } else {
            None
        }
    }
}

/// Wakes when the entry state changes
pub struct EntryWatcher {
    rx: watch::Receiver<u64>,
}

impl EntryWatcher {
    /// Wait for the next change made after the previous call
    pub async fn changed(&mut self) {
        let _ = self.rx.changed().await;
    }
}

struct EntryState {
    status: EntryStatus,
    confirmed: u64,
    total: Option<u64>,
    header: Option<HttpHeader>,
    owner: Option<u64>,
    generation: u64,
    probe: Option<u8>,
    validated_at: Option<SystemTime>,
    error: Option<ProxyError>,
    /// Read handle on the data file of the current generation
    reader: Option<Arc<File>>,
}

impl EntryState {
    fn fresh(generation: u64) -> Self {
        EntryState {
            status: EntryStatus::Fresh,
            confirmed: 0,
            total: None,
            header: None,
            owner: None,
            generation,
            probe: None,
            validated_at: None,
            error: None,
            reader: None,
        }
    }
}

struct Writer {
    file: fs::File,
    offset: u64,
}

enum DiskState {
    Empty,
    Partial {
        header: HttpHeader,
        size: u64,
        reader: Option<Arc<File>>,
    },
    Whole {
        header: HttpHeader,
        size: u64,
        reader: Option<Arc<File>>,
        validated_at: Option<SystemTime>,
        stale: bool,
    },
}

/// Shared record of one cached resource
pub struct CacheEntry {
    path_rel: String,
    data_path: PathBuf,
    head_path: PathBuf,
    freshness: Option<Duration>,
    state: Mutex<EntryState>,
    notify: watch::Sender<u64>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    /// Set when the writer could not be closed because its lock was held
    writer_drop_pending: AtomicBool,
    probe_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("path", &self.path_rel)
            .field("status", &self.status())
            .field("confirmed", &self.confirmed_size())
            .finish()
    }
}

impl CacheEntry {
    /// Create an entry for `path_rel` below `cache_dir`
    ///
    /// # Arguments
    /// * `cache_dir` - Cache root directory
    /// * `path_rel` - Cache-relative path of the data file
    /// * `freshness` - Maximum age of a complete copy for volatile files,
    ///   `None` for files that never change upstream
    pub fn new(cache_dir: &Path, path_rel: &str, freshness: Option<Duration>) -> Self {
        let data_path = cache_dir.join(path_rel);
        let mut head = data_path.clone().into_os_string();
        head.push(".head");
        let (notify, _) = watch::channel(0);

        CacheEntry {
            path_rel: path_rel.to_string(),
            data_path,
            head_path: PathBuf::from(head),
            freshness,
            state: Mutex::new(EntryState::fresh(0)),
            notify,
            writer: tokio::sync::Mutex::new(None),
            writer_drop_pending: AtomicBool::new(false),
            probe_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path_rel
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn head_path(&self) -> &Path {
        &self.head_path
    }

    pub fn is_volatile(&self) -> bool {
        self.freshness.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wake(&self) {
        self.notify.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Register interest in state changes made from now on
    pub fn subscribe(&self) -> EntryWatcher {
        EntryWatcher {
            rx: self.notify.subscribe(),
        }
    }

    pub fn status(&self) -> EntryStatus {
        self.lock().status
    }

    pub fn confirmed_size(&self) -> u64 {
        self.lock().confirmed
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        let st = self.lock();
        EntrySnapshot {
            status: st.status,
            confirmed: st.confirmed,
            total: st.total,
            header: st.header.clone(),
            generation: st.generation,
            error: st.error.clone(),
            probe_pending: st.probe.is_some(),
        }
    }

    /// Size used for keep-warm decisions
    pub fn size_hint(&self) -> u64 {
        let st = self.lock();
        st.total.unwrap_or(st.confirmed)
    }

    /// Whether a complete volatile copy is older than its freshness window
    pub fn is_stale(&self) -> bool {
        let max_age = match self.freshness {
            Some(max_age) => max_age,
            None => return false,
        };
        let st = self.lock();
        st.status == EntryStatus::Complete && is_older_than(st.validated_at, max_age)
    }

    /// Inspect the on-disk state of a fresh entry
    ///
    /// Complete copies of volatile files are reported as `Inited` when they
    /// are stale or `force_freshness_check` is set, so they get revalidated.
    /// Inconsistent data/sidecar pairs are deleted.
    pub async fn probe(&self, force_freshness_check: bool) -> EntryStatus {
        let _guard = self.probe_lock.lock().await;
        let current = self.status();
        if current != EntryStatus::Fresh {
            return current;
        }

        let disk = self.inspect_disk(force_freshness_check).await;

        let status = {
            let mut st = self.lock();
            if st.status != EntryStatus::Fresh {
                return st.status;
            }
            match disk {
                DiskState::Empty => {
                    st.status = EntryStatus::Inited;
                }
                DiskState::Partial { header, size, reader } => {
                    st.status = EntryStatus::Inited;
                    st.confirmed = size;
                    st.total = header.content_length();
                    st.header = Some(header);
                    st.reader = reader;
                }
                DiskState::Whole {
                    header,
                    size,
                    reader,
                    validated_at,
                    stale,
                } => {
                    st.status = if stale {
                        EntryStatus::Inited
                    } else {
                        EntryStatus::Complete
                    };
                    st.confirmed = size;
                    st.total = Some(size);
                    st.header = Some(header);
                    st.reader = reader;
                    st.validated_at = validated_at;
                }
            }
            debug!(
                "Probed {}: status={:?} confirmed={}",
                self.path_rel, st.status, st.confirmed
            );
            st.status
        };
        self.wake();
        status
    }

    async fn inspect_disk(&self, force_freshness_check: bool) -> DiskState {
        let raw = match fs::read(&self.head_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Data without a sidecar cannot be validated
                remove_if_exists(&self.data_path).await;
                return DiskState::Empty;
            }
            Err(e) => {
                warn!("Cannot read header sidecar for {}: {}", self.path_rel, e);
                self.remove_remnants().await;
                return DiskState::Empty;
            }
        };

        let header = match HttpHeader::parse(&raw) {
            Ok(Some((header, _))) if header.status() == Some(200) => header,
            _ => {
                warn!("Corrupt header sidecar for {}, discarding", self.path_rel);
                self.remove_remnants().await;
                return DiskState::Empty;
            }
        };

        let size = match fs::metadata(&self.data_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => {
                warn!("Cannot stat cached data for {}: {}", self.path_rel, e);
                self.remove_remnants().await;
                return DiskState::Empty;
            }
        };

        if header.content_length().is_some_and(|declared| declared < size) {
            warn!(
                "Cached data for {} exceeds declared length ({} > {:?}), discarding",
                self.path_rel,
                size,
                header.content_length()
            );
            self.remove_remnants().await;
            return DiskState::Empty;
        }

        // Pin the inode now so a later replacement at this path is never read
        let reader = if size > 0 {
            match fs::File::open(&self.data_path).await {
                Ok(file) => Some(Arc::new(file.into_std().await)),
                Err(e) => {
                    warn!("Cannot open cached data for {}: {}", self.path_rel, e);
                    self.remove_remnants().await;
                    return DiskState::Empty;
                }
            }
        } else {
            None
        };

        match header.content_length() {
            Some(declared) if declared == size => {
                let validated_at = fs::metadata(&self.head_path)
                    .await
                    .and_then(|m| m.modified())
                    .ok();
                let stale = match self.freshness {
                    Some(max_age) => force_freshness_check || is_older_than(validated_at, max_age),
                    None => false,
                };
                DiskState::Whole {
                    header,
                    size,
                    reader,
                    validated_at,
                    stale,
                }
            }
            _ => DiskState::Partial { header, size, reader },
        }
    }

    /// Claim the entry for the downloader `owner`
    ///
    /// The first agent to move the entry out of `Inited` owns it; later
    /// agents are refused unless they already are the owner.
    pub fn try_assign(&self, owner: u64) -> bool {
        let assigned = {
            let mut st = self.lock();
            match st.status {
                EntryStatus::Inited => {
                    st.status = EntryStatus::DlAssigned;
                    st.owner = Some(owner);
                    st.error = None;
                    true
                }
                s if s.is_downloading() => return st.owner == Some(owner),
                _ => return false,
            }
        };
        self.wake();
        assigned
    }

    /// Whether `owner` still owns an unfinished download of this entry
    pub fn is_owned_by(&self, owner: u64) -> bool {
        let st = self.lock();
        st.owner == Some(owner) && st.status.is_downloading()
    }

    /// Where the next request for this entry should start
    pub fn resume_point(&self) -> ResumePoint {
        let st = self.lock();
        ResumePoint {
            confirmed: st.confirmed,
            whole: st.confirmed > 0 && st.total == Some(st.confirmed),
            last_modified: st
                .header
                .as_ref()
                .and_then(|h| h.get(HeaderField::LastModified))
                .map(str::to_string),
        }
    }

    /// Accept or refuse an upstream response header
    ///
    /// # Arguments
    /// * `owner` - Downloader id that was assigned the entry
    /// * `remote` - Response header from upstream
    /// * `requested_from` - First byte requested, for ranged resumes
    /// * `source` - URL the response came from
    ///
    /// # Returns
    /// * `Ok(BeginOutcome)` describing what to do with the body
    /// * `Err(ProxyError)` when local storage failed; the entry is already
    ///   marked failed in that case
    pub async fn begin_download(
        &self,
        owner: u64,
        remote: &HttpHeader,
        requested_from: Option<u64>,
        source: &str,
    ) -> Result<BeginOutcome> {
        let status = remote.status().unwrap_or(0);
        let (confirmed, total, current) = {
            let st = self.lock();
            if st.owner != Some(owner) || st.status != EntryStatus::DlAssigned {
                return Ok(BeginOutcome::Rejected);
            }
            (st.confirmed, st.total, st.header.clone())
        };

        match status {
            200 => {
                self.reinit_storage().await?;
                let total = remote.content_length();
                let header = storable_header(remote, total, source);
                self.store_sidecar(&header).await?;
                {
                    let mut st = self.lock();
                    if st.owner != Some(owner) || st.status != EntryStatus::DlAssigned {
                        return Ok(BeginOutcome::Rejected);
                    }
                    st.status = EntryStatus::DlGotHead;
                    st.confirmed = 0;
                    st.total = total;
                    st.header = Some(header);
                    st.probe = None;
                    st.validated_at = Some(SystemTime::now());
                }
                debug!("Storing {} from offset 0, length {:?}", self.path_rel, total);
                self.wake();
                Ok(BeginOutcome::Accepted)
            }
            206 => {
                let expected = match requested_from {
                    Some(start) if start + 1 == confirmed => start,
                    _ => {
                        warn!("Unrequested partial response for {}", self.path_rel);
                        self.restart_storage().await;
                        return Ok(BeginOutcome::Restart);
                    }
                };
                let parsed = remote
                    .get(HeaderField::ContentRange)
                    .and_then(|v| ContentRange::parse(v).ok());
                let remote_total = match parsed {
                    Some(ContentRange {
                        range: Some(range),
                        total: Some(total),
                    }) if range.start == expected => total,
                    _ => {
                        warn!(
                            "Content-Range of {} does not continue at {}",
                            self.path_rel, expected
                        );
                        self.restart_storage().await;
                        return Ok(BeginOutcome::Restart);
                    }
                };
                if let Some(declared) = current.as_ref().and_then(|h| h.content_length()) {
                    if declared != remote_total {
                        info!(
                            "Length of {} changed upstream ({} -> {}), restarting",
                            self.path_rel, declared, remote_total
                        );
                        self.restart_storage().await;
                        return Ok(BeginOutcome::Restart);
                    }
                }
                let probe = match self.read_byte_at(expected).await {
                    Ok(byte) => byte,
                    Err(e) => {
                        warn!("Cannot read probe byte of {}: {}", self.path_rel, e);
                        self.restart_storage().await;
                        return Ok(BeginOutcome::Restart);
                    }
                };

                let mut header =
                    current.unwrap_or_else(|| storable_header(remote, Some(remote_total), source));
                header.set(HeaderField::ContentLength, remote_total.to_string());
                if let Some(lm) = remote.get(HeaderField::LastModified) {
                    header.set(HeaderField::LastModified, lm);
                }
                header.set(HeaderField::XOriginalSource, source);
                {
                    let mut st = self.lock();
                    if st.owner != Some(owner) || st.status != EntryStatus::DlAssigned {
                        return Ok(BeginOutcome::Rejected);
                    }
                    st.status = EntryStatus::DlGotHead;
                    st.total = Some(remote_total);
                    st.header = Some(header);
                    st.probe = Some(probe);
                }
                debug!(
                    "Resuming {} at {} of {}",
                    self.path_rel, confirmed, remote_total
                );
                self.wake();
                Ok(BeginOutcome::Accepted)
            }
            416 if requested_from.is_some() => {
                info!("Resume of {} not satisfiable, restarting", self.path_rel);
                self.restart_storage().await;
                Ok(BeginOutcome::Restart)
            }
            304 if confirmed > 0 && total == Some(confirmed) => {
                if let Some(header) = current.as_ref() {
                    // Rewriting the sidecar records the validation time
                    self.store_sidecar(header).await?;
                }
                {
                    let mut st = self.lock();
                    st.status = EntryStatus::Complete;
                    st.validated_at = Some(SystemTime::now());
                }
                debug!("{} confirmed unchanged upstream", self.path_rel);
                self.wake();
                Ok(BeginOutcome::Confirmed)
            }
            304 => {
                self.fail(
                    Some(owner),
                    ProxyError::from_http_status(502, "Unexpected 304 for uncached file"),
                );
                Ok(BeginOutcome::Failed)
            }
            _ => {
                let reason = remote.reason().unwrap_or("Upstream error").to_string();
                self.fail(Some(owner), ProxyError::from_http_status(status, reason));
                Ok(BeginOutcome::Failed)
            }
        }
    }

    /// Store body bytes; an empty slice finishes the download
    ///
    /// # Returns
    /// * `Err(ProxyError::Collision)` if `owner` no longer owns the entry
    /// * `Err(ProxyError::ResumeMismatch)` if the probe byte differed; the
    ///   cached data was dropped and the download must start over
    /// * storage errors, after the entry has been marked failed
    pub async fn append_body(&self, owner: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return self.finish(owner).await;
        }

        let (offset, probe) = {
            let mut st = self.lock();
            self.check_writer(&st, owner)?;
            (st.confirmed, st.probe.take())
        };

        let mut data = data;
        if let Some(expected) = probe {
            if data[0] != expected {
                warn!(
                    "Probe byte mismatch for {} at offset {}, restarting",
                    self.path_rel,
                    offset.saturating_sub(1)
                );
                self.restart_storage().await;
                return Err(ProxyError::ResumeMismatch(self.path_rel.clone()));
            }
            data = &data[1..];
            if data.is_empty() {
                self.wake();
                return Ok(());
            }
        }

        {
            let mut writer = self.lock_writer().await;
            if writer.is_none() {
                let file = match fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&self.data_path)
                    .await
                {
                    Ok(file) => file,
                    Err(e) => return Err(self.storage_failure("open cache data", &e).await),
                };
                *writer = Some(Writer { file, offset: u64::MAX });
            }
            let w = writer
                .as_mut()
                .ok_or_else(|| ProxyError::InternalError("writer vanished".to_string()))?;

            let written = async {
                if w.offset != offset {
                    w.file.seek(SeekFrom::Start(offset)).await?;
                    w.offset = offset;
                }
                w.file.write_all(data).await?;
                w.file.flush().await
            }
            .await;
            if let Err(e) = written {
                *writer = None;
                return Err(self.storage_failure("write cache data", &e).await);
            }
            w.offset += data.len() as u64;
            if self.writer_drop_pending.swap(false, Ordering::AcqRel) {
                *writer = None;
            }
        }

        {
            let mut st = self.lock();
            st.confirmed = offset + data.len() as u64;
            if st.status == EntryStatus::DlGotHead {
                st.status = EntryStatus::DlReceiving;
            }
        }
        self.wake();
        Ok(())
    }

    async fn finish(&self, owner: u64) -> Result<()> {
        let header = {
            let st = self.lock();
            self.check_writer(&st, owner)?;
            if let Some(total) = st.total {
                if st.confirmed != total {
                    return Err(ProxyError::ProtocolError(format!(
                        "{} ended at {} of {} bytes",
                        self.path_rel, st.confirmed, total
                    )));
                }
            }
            let mut header = st
                .header
                .clone()
                .ok_or_else(|| ProxyError::InternalError("finish without header".to_string()))?;
            // Chunked transfers learn their length only now
            header.set(HeaderField::ContentLength, st.confirmed.to_string());
            header
        };

        {
            let mut writer = self.lock_writer().await;
            if let Some(w) = writer.take() {
                if let Err(e) = w.file.sync_data().await {
                    return Err(self.storage_failure("sync cache data", &e).await);
                }
            }
        }
        self.store_sidecar(&header).await?;

        let size = {
            let mut st = self.lock();
            st.total = Some(st.confirmed);
            st.header = Some(header);
            st.status = EntryStatus::Complete;
            st.validated_at = Some(SystemTime::now());
            st.confirmed
        };
        info!("Completed {} ({} bytes)", self.path_rel, size);
        self.wake();
        Ok(())
    }

    fn check_writer(&self, st: &EntryState, owner: u64) -> Result<()> {
        let receiving = matches!(st.status, EntryStatus::DlGotHead | EntryStatus::DlReceiving);
        if st.owner == Some(owner) && receiving {
            Ok(())
        } else {
            Err(ProxyError::Collision(self.path_rel.clone()))
        }
    }

    /// Mark the entry failed with a synthesized error header
    ///
    /// With `owner` set the call is ignored unless that agent owns the
    /// entry. Terminal entries are left alone.
    pub fn fail(&self, owner: Option<u64>, err: ProxyError) {
        {
            let mut st = self.lock();
            if st.status.is_terminal() {
                return;
            }
            if owner.is_some() && st.owner != owner {
                return;
            }
            debug!("Download of {} failed: {}", self.path_rel, err);
            st.status = EntryStatus::DlError;
            st.header = Some(error_header(&err));
            st.error = Some(err);
            st.probe = None;
        }
        self.drop_writer();
        self.wake();
    }

    /// Interrupt an unfinished download for shutdown
    pub fn stop(&self) {
        {
            let mut st = self.lock();
            if st.status.is_terminal() || st.status == EntryStatus::Fresh {
                return;
            }
            st.status = EntryStatus::DlStop;
            st.header = Some(error_header(&ProxyError::Shutdown));
            st.error = Some(ProxyError::Shutdown);
            st.probe = None;
        }
        self.drop_writer();
        self.wake();
    }

    /// Hand an interrupted download back to its owner for requeueing
    ///
    /// Cached bytes stay valid; the next request resumes after them.
    pub fn rewind(&self, owner: u64) -> bool {
        {
            let mut st = self.lock();
            if st.owner != Some(owner) || !st.status.is_downloading() {
                return false;
            }
            st.status = EntryStatus::DlAssigned;
            st.probe = None;
        }
        self.drop_writer();
        self.wake();
        true
    }

    /// Read handle on the data file together with its generation
    ///
    /// The handle was opened when the disk state was probed or the file was
    /// created, so it keeps pointing at this entry's data even after a
    /// replacement entry recreated the file at the same path.
    pub fn reader(&self) -> Option<(Arc<File>, u64)> {
        let st = self.lock();
        st.reader.as_ref().map(|file| (Arc::clone(file), st.generation))
    }

    async fn lock_writer(&self) -> tokio::sync::MutexGuard<'_, Option<Writer>> {
        let mut writer = self.writer.lock().await;
        if self.writer_drop_pending.swap(false, Ordering::AcqRel) {
            *writer = None;
        }
        writer
    }

    fn drop_writer(&self) {
        match self.writer.try_lock() {
            Ok(mut writer) => *writer = None,
            // Whoever holds the lock closes it on the way out
            Err(_) => self.writer_drop_pending.store(true, Ordering::Release),
        }
    }

    /// Replace the data file with an empty one
    ///
    /// A new inode is created so readers of an older copy are unaffected.
    async fn reinit_storage(&self) -> Result<()> {
        let mut writer = self.lock_writer().await;
        *writer = None;

        if let Some(parent) = self.data_path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return Err(self.storage_failure("create cache directory", &e).await);
            }
        }
        match fs::remove_file(&self.data_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(self.storage_failure("remove old cache data", &e).await),
        }
        let file = match fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.data_path)
            .await
        {
            Ok(file) => file,
            Err(e) => return Err(self.storage_failure("create cache data", &e).await),
        };
        let reader = match file.try_clone().await {
            Ok(clone) => Arc::new(clone.into_std().await),
            Err(e) => return Err(self.storage_failure("open cache data", &e).await),
        };
        *writer = Some(Writer { file, offset: 0 });
        drop(writer);

        let mut st = self.lock();
        st.reader = Some(reader);
        st.generation += 1;
        Ok(())
    }

    /// Drop cached bytes so the owner can download from offset zero
    async fn restart_storage(&self) {
        {
            let mut writer = self.lock_writer().await;
            *writer = None;
        }
        self.remove_remnants().await;
        {
            let mut st = self.lock();
            st.reader = None;
            st.confirmed = 0;
            st.total = None;
            st.header = None;
            st.probe = None;
            st.generation += 1;
            if st.status.is_downloading() {
                st.status = EntryStatus::DlAssigned;
            }
        }
        self.wake();
    }

    async fn read_byte_at(&self, offset: u64) -> std::io::Result<u8> {
        let mut file = fs::File::open(&self.data_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).await?;
        Ok(byte[0])
    }

    async fn store_sidecar(&self, header: &HttpHeader) -> Result<()> {
        let bytes = header.to_bytes();
        let head_path = self.head_path.clone();
        let written = tokio::task::spawn_blocking(move || write_atomic(&head_path, &bytes))
            .await
            .map_err(|e| ProxyError::InternalError(format!("sidecar writer panicked: {}", e)))?;
        match written {
            Ok(()) => Ok(()),
            Err(e) => Err(self.storage_failure("write header sidecar", &e).await),
        }
    }

    /// Mark the entry failed after a local I/O error and delete its files
    async fn storage_failure(&self, context: &str, err: &std::io::Error) -> ProxyError {
        let mapped = ProxyError::from_storage_io(context, err);
        error!("Storage failure on {}: {}", self.path_rel, mapped);
        self.remove_remnants().await;
        {
            let mut st = self.lock();
            st.status = EntryStatus::DlError;
            st.header = Some(error_header(&mapped));
            st.error = Some(mapped.clone());
            st.reader = None;
            st.confirmed = 0;
            st.total = None;
            st.probe = None;
            st.generation += 1;
        }
        self.wake();
        mapped
    }

    async fn remove_remnants(&self) {
        remove_if_exists(&self.head_path).await;
        remove_if_exists(&self.data_path).await;
    }
}

async fn remove_if_exists(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "sidecar has no parent"))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn is_older_than(time: Option<SystemTime>, max_age: Duration) -> bool {
    match time.map(|t| t.elapsed()) {
        Some(Ok(age)) => age > max_age,
        Some(Err(_)) => false,
        None => true,
    }
}

/// The header persisted for a successfully fetched resource
fn storable_header(remote: &HttpHeader, total: Option<u64>, source: &str) -> HttpHeader {
    let mut header = HttpHeader::answer_for(200);
    if let Some(total) = total {
        header.set(HeaderField::ContentLength, total.to_string());
    }
    for field in [HeaderField::ContentType, HeaderField::LastModified] {
        if let Some(value) = remote.get(field) {
            header.set(field, value);
        }
    }
    header.set(HeaderField::XOriginalSource, source);
    header
}

/// Minimal response header describing a failure
pub fn error_header(err: &ProxyError) -> HttpHeader {
    let mut header = HttpHeader::answer(err.to_http_status(), err.status_message());
    header.set(HeaderField::ContentLength, "0");
    header
}
