//! Cache registry
//!
//! Maps cache paths to at most one live `CacheEntry`. The map only holds
//! weak references; an entry lives as long as some `EntryHandle` does, plus
//! an optional grace period for small or volatile entries.

use crate::cache_entry::CacheEntry;
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// What to do when a path already has a live entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingPolicy {
    /// Always share the existing entry
    AlwaysAttach,
    /// Replace failed entries and stale volatile copies
    ReplaceAsNeeded,
    /// Replace any finished entry; in-flight downloads are still shared
    AlwaysReplace,
}

/// Process-wide table of live cache entries
pub struct CacheRegistry {
    cache_dir: PathBuf,
    entries: Mutex<HashMap<String, Weak<CacheEntry>>>,
    keep_warm: Mutex<VecDeque<(Instant, Arc<CacheEntry>)>>,
    grace: Duration,
    keep_warm_threshold: u64,
}

impl CacheRegistry {
    /// Create a new registry rooted at `cache_dir`
    ///
    /// # Arguments
    /// * `grace` - How long released small or volatile entries stay warm
    /// * `keep_warm_threshold` - Entries below this size are kept warm
    pub fn new(cache_dir: impl Into<PathBuf>, grace: Duration, keep_warm_threshold: u64) -> Arc<Self> {
        Arc::new(CacheRegistry {
            cache_dir: cache_dir.into(),
            entries: Mutex::new(HashMap::new()),
            keep_warm: Mutex::new(VecDeque::new()),
            grace,
            keep_warm_threshold,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Weak<CacheEntry>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn keep_warm(&self) -> MutexGuard<'_, VecDeque<(Instant, Arc<CacheEntry>)>> {
        self.keep_warm.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the live entry for `path`, or create one
    ///
    /// # Arguments
    /// * `path` - Cache-relative path
    /// * `policy` - How to treat an existing entry
    /// * `freshness` - Freshness window for volatile files, used when a new
    ///   entry is created
    pub fn get_or_create(
        self: &Arc<Self>,
        path: &str,
        policy: SharingPolicy,
        freshness: Option<Duration>,
    ) -> EntryHandle {
        self.prune_keep_warm();

        let mut entries = self.entries();
        if let Some(existing) = entries.get(path).and_then(Weak::upgrade) {
            let status = existing.status();
            let replace = match policy {
                SharingPolicy::AlwaysAttach => false,
                SharingPolicy::ReplaceAsNeeded => status.is_failed() || existing.is_stale(),
                SharingPolicy::AlwaysReplace => status.is_terminal(),
            };
            if !replace {
                return EntryHandle {
                    entry: Some(existing),
                    registry: Arc::clone(self),
                };
            }
            debug!("Replacing {:?} entry for {}", status, path);
        }

        let entry = Arc::new(CacheEntry::new(&self.cache_dir, path, freshness));
        entries.insert(path.to_string(), Arc::downgrade(&entry));
        EntryHandle {
            entry: Some(entry),
            registry: Arc::clone(self),
        }
    }

    /// Whether a live entry exists for `path`
    pub fn contains(&self, path: &str) -> bool {
        self.entries()
            .get(path)
            .map(|w| w.strong_count() > 0)
            .unwrap_or(false)
    }

    /// Number of live entries
    pub fn live_entries(&self) -> usize {
        self.entries()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Interrupt every unfinished entry and drop warm references
    pub fn shutdown(&self) {
        let live: Vec<Arc<CacheEntry>> = self.entries().values().filter_map(Weak::upgrade).collect();
        for entry in live {
            entry.stop();
        }
        self.keep_warm().clear();
    }

    fn release(&self, entry: Arc<CacheEntry>) {
        let mut entries = self.entries();
        // Upgrades only happen under the map lock, so this count is stable
        if Arc::strong_count(&entry) > 1 {
            return;
        }

        let warm = !self.grace.is_zero()
            && entry.status().is_terminal()
            && !entry.status().is_failed()
            && (entry.is_volatile() || entry.size_hint() < self.keep_warm_threshold);
        if warm {
            drop(entries);
            self.keep_warm().push_back((Instant::now() + self.grace, entry));
            return;
        }

        forget(&mut entries, &entry);
    }

    fn prune_keep_warm(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<CacheEntry>> = {
            let mut warm = self.keep_warm();
            let mut expired = Vec::new();
            while warm.front().map(|(deadline, _)| *deadline <= now).unwrap_or(false) {
                if let Some((_, entry)) = warm.pop_front() {
                    expired.push(entry);
                }
            }
            expired
        };
        if expired.is_empty() {
            return;
        }

        let mut entries = self.entries();
        for entry in expired {
            if Arc::strong_count(&entry) == 1 {
                forget(&mut entries, &entry);
            }
        }
    }
}

fn forget(entries: &mut HashMap<String, Weak<CacheEntry>>, entry: &Arc<CacheEntry>) {
    let path = entry.path();
    let current = entries
        .get(path)
        .map(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(entry)))
        .unwrap_or(false);
    if current {
        entries.remove(path);
        debug!("Released entry {}", path);
    }
}

/// Shared handle on a registry entry; releases it when dropped
pub struct EntryHandle {
    entry: Option<Arc<CacheEntry>>,
    registry: Arc<CacheRegistry>,
}

impl EntryHandle {
    pub fn entry(&self) -> &Arc<CacheEntry> {
        // Only `drop` takes the entry out
        self.entry.as_ref().unwrap_or_else(|| unreachable!("entry handle used after release"))
    }

    /// Whether both handles refer to the same entry
    pub fn same_entry(&self, other: &EntryHandle) -> bool {
        Arc::ptr_eq(self.entry(), other.entry())
    }
}

impl Deref for EntryHandle {
    type Target = CacheEntry;

    fn deref(&self) -> &CacheEntry {
        self.entry()
    }
}

impl Clone for EntryHandle {
    fn clone(&self) -> Self {
        EntryHandle {
            entry: self.entry.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl std::fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.entry {
            Some(entry) => entry.fmt(f),
            None => f.write_str("EntryHandle(released)"),
        }
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.registry.release(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_entry::EntryStatus;
    use crate::error::ProxyError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_same_path_shares_entry() {
        let dir = TempDir::new().unwrap();
        let registry = CacheRegistry::new(dir.path(), Duration::ZERO, 0);
        let a = registry.get_or_create("r/a", SharingPolicy::AlwaysAttach, None);
        let b = registry.get_or_create("r/a", SharingPolicy::ReplaceAsNeeded, None);
        assert!(a.same_entry(&b));
        assert_eq!(registry.live_entries(), 1);
        let c = registry.get_or_create("r/c", SharingPolicy::AlwaysAttach, None);
        assert!(!a.same_entry(&c));
    }

    #[tokio::test]
    async fn test_release_forgets_entry() {
        let dir = TempDir::new().unwrap();
        let registry = CacheRegistry::new(dir.path(), Duration::ZERO, 0);
        let a = registry.get_or_create("r/a", SharingPolicy::AlwaysAttach, None);
        let b = a.clone();
        drop(a);
        assert!(registry.contains("r/a"));
        drop(b);
        assert!(!registry.contains("r/a"));
        assert_eq!(registry.live_entries(), 0);
    }

    #[tokio::test]
    async fn test_failed_entry_is_replaced() {
        let dir = TempDir::new().unwrap();
        let registry = CacheRegistry::new(dir.path(), Duration::ZERO, 0);
        let a = registry.get_or_create("r/a", SharingPolicy::AlwaysAttach, None);
        a.probe(false).await;
        a.fail(None, ProxyError::Timeout("slow".to_string()));
        assert_eq!(a.status(), EntryStatus::DlError);

        let attached = registry.get_or_create("r/a", SharingPolicy::AlwaysAttach, None);
        assert!(attached.same_entry(&a));

        let replaced = registry.get_or_create("r/a", SharingPolicy::ReplaceAsNeeded, None);
        assert!(!replaced.same_entry(&a));
        assert_eq!(replaced.status(), EntryStatus::Fresh);

        // The old holder leaving must not evict the replacement
        drop(a);
        drop(attached);
        assert!(registry.contains("r/a"));
    }

    #[tokio::test]
    async fn test_always_replace_shares_in_flight_download() {
        let dir = TempDir::new().unwrap();
        let registry = CacheRegistry::new(dir.path(), Duration::ZERO, 0);
        let a = registry.get_or_create("r/a", SharingPolicy::AlwaysAttach, None);
        a.probe(false).await;
        assert!(a.try_assign(1));

        let b = registry.get_or_create("r/a", SharingPolicy::AlwaysReplace, None);
        assert!(b.same_entry(&a));
    }

    #[tokio::test]
    async fn test_keep_warm_grace() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("r")).unwrap();
        std::fs::write(dir.path().join("r/small"), b"abc").unwrap();
        std::fs::write(
            dir.path().join("r/small.head"),
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n",
        )
        .unwrap();

        let registry = CacheRegistry::new(dir.path(), Duration::from_millis(50), 1024);
        let a = registry.get_or_create("r/small", SharingPolicy::AlwaysAttach, None);
        assert_eq!(a.probe(false).await, EntryStatus::Complete);
        drop(a);
        assert!(registry.contains("r/small"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let _other = registry.get_or_create("r/other", SharingPolicy::AlwaysAttach, None);
        assert!(!registry.contains("r/small"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_downloads() {
        let dir = TempDir::new().unwrap();
        let registry = CacheRegistry::new(dir.path(), Duration::ZERO, 0);
        let a = registry.get_or_create("r/a", SharingPolicy::AlwaysAttach, None);
        a.probe(false).await;
        a.try_assign(9);
        registry.shutdown();
        assert_eq!(a.status(), EntryStatus::DlStop);
    }
}
