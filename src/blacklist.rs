//! Time-bounded backend blacklist shared by all downloaders

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backends that recently failed, keyed by `host:port`
pub struct BackendBlacklist {
    entries: Mutex<HashMap<String, BlockedBackend>>,
    duration: Duration,
}

#[derive(Debug, Clone)]
struct BlockedBackend {
    until: Instant,
    reason: String,
}

impl BackendBlacklist {
    /// Create a blacklist whose entries expire after `duration`
    pub fn new(duration: Duration) -> Self {
        BackendBlacklist {
            entries: Mutex::new(HashMap::new()),
            duration,
        }
    }

    /// Canonical key for a backend
    pub fn key(host: &str, port: u16) -> String {
        format!("{}:{}", host.to_ascii_lowercase(), port)
    }

    /// Skip `key` until the blacklist duration has passed
    pub fn block(&self, key: &str, reason: &str) {
        if self.duration.is_zero() {
            return;
        }
        warn!("Blacklisting backend {} for {:?}: {}", key, self.duration, reason);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_string(),
            BlockedBackend {
                until: Instant::now() + self.duration,
                reason: reason.to_string(),
            },
        );
    }

    /// The reason `key` is blocked, or `None` if it may be used
    pub fn blocked_reason(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(blocked) if blocked.until > Instant::now() => Some(blocked.reason.clone()),
            Some(_) => {
                debug!("Blacklist entry for {} expired", key);
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn is_blocked(&self, key: &str) -> bool {
        self.blocked_reason(key).is_some()
    }

    /// Forget a backend after it served successfully
    pub fn unblock(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    /// Number of currently blocked backends
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|b| b.until > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
