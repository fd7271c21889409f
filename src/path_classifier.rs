//! Request target resolution and volatile-file classification
//!
//! Maps a client request line to a cache path plus the place the bytes come
//! from, and decides whether a path names an index file that changes upstream.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use http::Method;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Where a download fetches its bytes from
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadSource {
    /// A single URL (forward-proxy passthrough)
    Direct(Url),
    /// An ordered mirror list; `suffix` is appended to each backend base
    Mirrors {
        repository: String,
        backends: Arc<Vec<Url>>,
        suffix: String,
        marker_file: Option<String>,
    },
}

impl DownloadSource {
    /// Number of distinct places this source can be fetched from
    pub fn backend_count(&self) -> usize {
        match self {
            DownloadSource::Direct(_) => 1,
            DownloadSource::Mirrors { backends, .. } => backends.len(),
        }
    }

    /// URL for the backend at `index`
    pub fn url_for(&self, index: usize) -> Option<Url> {
        match self {
            DownloadSource::Direct(url) if index == 0 => Some(url.clone()),
            DownloadSource::Direct(_) => None,
            DownloadSource::Mirrors {
                backends, suffix, ..
            } => backends.get(index).and_then(|base| join_backend(base, suffix)),
        }
    }

    /// Whether `suffix` is the repository's marker file
    pub fn is_marker(&self) -> bool {
        match self {
            DownloadSource::Mirrors {
                suffix,
                marker_file: Some(marker),
                ..
            } => suffix == marker.trim_start_matches('/'),
            _ => false,
        }
    }
}

fn join_backend(base: &Url, suffix: &str) -> Option<Url> {
    let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), suffix);
    Url::parse(&joined).ok()
}

/// A resolved client request target
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Cache-relative path of the data file
    pub cache_path: String,
    pub source: DownloadSource,
    /// Whether the path names an index file that changes upstream
    pub volatile: bool,
}

struct Repository {
    name: String,
    backends: Arc<Vec<Url>>,
    marker_file: Option<String>,
    remap_prefixes: Vec<String>,
}

/// Resolves request targets against the configured repositories
pub struct PathClassifier {
    repositories: Vec<Repository>,
    volatile_patterns: Vec<String>,
    allow_direct: bool,
}

impl PathClassifier {
    /// Create a new PathClassifier from the proxy configuration
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let mut repositories = Vec::with_capacity(config.repositories.len());
        for repo in &config.repositories {
            repositories.push(Repository {
                name: repo.name.clone(),
                backends: Arc::new(repo.backend_urls()?),
                marker_file: repo.marker_file.clone(),
                remap_prefixes: repo
                    .remap_prefixes
                    .iter()
                    .map(|p| format!("{}/", p.trim_end_matches('/')))
                    .collect(),
            });
        }

        Ok(PathClassifier {
            repositories,
            volatile_patterns: config.volatile_patterns.clone(),
            allow_direct: config.allow_direct,
        })
    }

    /// Resolve a request line into a cache target
    ///
    /// # Arguments
    /// * `method` - Request method; only GET and HEAD are served
    /// * `target` - Request target in origin-form or absolute-form
    ///
    /// # Returns
    /// * `Ok(Target)` for servable requests
    /// * `Err(ProxyError::MethodNotAllowed)` for other methods
    /// * `Err(ProxyError::Forbidden)` for unsafe or unknown targets
    pub fn resolve(&self, method: &Method, target: &str) -> Result<Target> {
        if method != Method::GET && method != Method::HEAD {
            return Err(ProxyError::MethodNotAllowed(method.to_string()));
        }

        if target.contains('?') || target.contains('#') {
            return Err(ProxyError::Forbidden(format!(
                "query strings are not cached: {}",
                target
            )));
        }

        let lower = target.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            self.resolve_absolute(target)
        } else if let Some(path) = target.strip_prefix('/') {
            self.resolve_origin(path)
        } else {
            Err(ProxyError::Forbidden(format!("unsupported target: {}", target)))
        }
    }

    fn resolve_origin(&self, path: &str) -> Result<Target> {
        let path = check_path(path)?;
        let (first, rest) = path.split_once('/').unwrap_or((path.as_str(), ""));

        if let Some(repo) = self.repositories.iter().find(|r| r.name == first) {
            let suffix = check_path(rest)?;
            return Ok(self.mirror_target(repo, suffix));
        }

        // `/host.name/path` is served as a direct download
        if self.allow_direct && first.contains('.') && !rest.is_empty() {
            let url = Url::parse(&format!("http://{}", path))
                .map_err(|e| ProxyError::Forbidden(format!("invalid target {}: {}", path, e)))?;
            return Ok(self.direct_target(url));
        }

        Err(ProxyError::Forbidden(format!("unknown repository: {}", first)))
    }

    fn resolve_absolute(&self, target: &str) -> Result<Target> {
        // Reject traversal before URL normalization can hide it
        let after_scheme = target.split_once("://").map(|(_, r)| r).unwrap_or(target);
        if after_scheme.split('/').any(is_dot_segment) {
            return Err(ProxyError::Forbidden(format!("path traversal: {}", target)));
        }

        let url = Url::parse(target)
            .map_err(|e| ProxyError::Forbidden(format!("invalid target {}: {}", target, e)))?;
        if url.host_str().is_none() {
            return Err(ProxyError::Forbidden(format!("missing host: {}", target)));
        }

        for repo in &self.repositories {
            for prefix in &repo.remap_prefixes {
                if let Some(rest) = url.as_str().strip_prefix(prefix.as_str()) {
                    debug!("Remapped {} to repository {}", target, repo.name);
                    let suffix = check_path(rest)?;
                    return Ok(self.mirror_target(repo, suffix));
                }
            }
        }

        if !self.allow_direct {
            return Err(ProxyError::Forbidden(format!(
                "direct downloads are disabled: {}",
                target
            )));
        }

        check_path(url.path().trim_start_matches('/'))?;
        Ok(self.direct_target(url))
    }

    fn mirror_target(&self, repo: &Repository, suffix: String) -> Target {
        let cache_path = format!("{}/{}", repo.name, suffix);
        Target {
            volatile: self.is_volatile(&cache_path),
            cache_path,
            source: DownloadSource::Mirrors {
                repository: repo.name.clone(),
                backends: Arc::clone(&repo.backends),
                suffix,
                marker_file: repo.marker_file.clone(),
            },
        }
    }

    fn direct_target(&self, url: Url) -> Target {
        let host = match url.port() {
            Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
            None => url.host_str().unwrap_or_default().to_string(),
        };
        let cache_path = format!("{}{}", host, url.path());
        Target {
            volatile: self.is_volatile(&cache_path),
            cache_path,
            source: DownloadSource::Direct(url),
        }
    }

    /// Whether the cache path names a volatile index file
    pub fn is_volatile(&self, path: &str) -> bool {
        self.volatile_patterns
            .iter()
            .any(|pattern| pattern_matches(pattern, path))
    }
}

/// Validate a relative path and return it normalized
///
/// Empty segments are collapsed; dot segments, directory targets and names
/// that would clash with header sidecars are rejected.
fn check_path(path: &str) -> Result<String> {
    if path.is_empty() || path.ends_with('/') {
        return Err(ProxyError::Forbidden(format!(
            "not a file path: /{}",
            path
        )));
    }
    if path.split('/').any(is_dot_segment) {
        return Err(ProxyError::Forbidden(format!("path traversal: {}", path)));
    }
    if path.ends_with(".head") {
        return Err(ProxyError::Forbidden(format!("reserved file name: {}", path)));
    }
    if path.contains('\\') || path.contains('\0') {
        return Err(ProxyError::Forbidden(format!("invalid characters in {}", path)));
    }

    let normalized: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    Ok(normalized.join("/"))
}

fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

/// Check if a glob pattern matches the whole path
///
/// `*` matches any sequence of characters, everything else literally.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == path;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];

    if !path.starts_with(first) {
        return false;
    }
    if path.len() < first.len() + last.len() || !path.ends_with(last) {
        return false;
    }

    // Middle parts must appear in order between the anchors
    let window = &path[first.len()..path.len() - last.len()];
    let mut pos = 0;
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match window[pos..].find(part) {
            Some(found) => pos += found + part.len(),
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;

    fn classifier() -> PathClassifier {
        let config = ProxyConfig {
            repositories: vec![RepositoryConfig {
                name: "debian".to_string(),
                backends: vec![
                    "http://deb.debian.org/debian/".to_string(),
                    "https://mirror.example.org/debian".to_string(),
                ],
                marker_file: Some("dists/stable/Release".to_string()),
                remap_prefixes: vec!["http://ftp.debian.org/debian".to_string()],
            }],
            ..Default::default()
        };
        PathClassifier::new(&config).unwrap()
    }

    #[test]
    fn test_origin_form_maps_to_repository() {
        let target = classifier()
            .resolve(&Method::GET, "/debian/pool/main/h/hello/hello_2.10_amd64.deb")
            .unwrap();
        assert_eq!(target.cache_path, "debian/pool/main/h/hello/hello_2.10_amd64.deb");
        assert!(!target.volatile);
        assert_eq!(
            target.source.url_for(0).unwrap().as_str(),
            "http://deb.debian.org/debian/pool/main/h/hello/hello_2.10_amd64.deb"
        );
        assert_eq!(
            target.source.url_for(1).unwrap().as_str(),
            "https://mirror.example.org/debian/pool/main/h/hello/hello_2.10_amd64.deb"
        );
        assert!(target.source.url_for(2).is_none());
    }

    #[test]
    fn test_remap_prefix() {
        let target = classifier()
            .resolve(&Method::GET, "http://ftp.debian.org/debian/dists/stable/Release")
            .unwrap();
        assert_eq!(target.cache_path, "debian/dists/stable/Release");
        assert!(target.volatile);
        assert!(target.source.is_marker());
    }

    #[test]
    fn test_direct_passthrough() {
        let target = classifier()
            .resolve(&Method::HEAD, "http://example.com:8080/files/a.tar.gz")
            .unwrap();
        assert_eq!(target.cache_path, "example.com:8080/files/a.tar.gz");
        assert!(matches!(target.source, DownloadSource::Direct(_)));
    }

    #[test]
    fn test_rejections() {
        let c = classifier();
        let forbidden = |t: &str| matches!(c.resolve(&Method::GET, t), Err(ProxyError::Forbidden(_)));
        assert!(forbidden("/debian/../etc/passwd"));
        assert!(forbidden("/debian/%2e%2e/secret"));
        assert!(forbidden("http://example.com/a/../b"));
        assert!(forbidden("/debian/pool/x.deb?foo=bar"));
        assert!(forbidden("/debian/"));
        assert!(forbidden("/debian/pool/x.deb.head"));
        assert!(forbidden("/unknown/file"));
        assert!(matches!(
            c.resolve(&Method::POST, "/debian/x"),
            Err(ProxyError::MethodNotAllowed(_))
        ));
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("*/Release", "debian/dists/stable/Release"));
        assert!(!pattern_matches("*/Release", "debian/dists/stable/Release.gpg"));
        assert!(pattern_matches("*/Packages*", "debian/dists/stable/main/binary-amd64/Packages.xz"));
        assert!(pattern_matches("*.db", "arch/core/os/x86_64/core.db"));
        assert!(pattern_matches("a*b*c", "abc"));
        assert!(!pattern_matches("ab*ba", "aba"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("exact", "exactly"));
    }
}
