//! Configuration management for the caching proxy

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Top-level proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the client listener binds to (default: 0.0.0.0:3142)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Root directory for cached data and header sidecars
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Maximum number of concurrently served client connections (default: 500)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Runtime worker threads (default: 4)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// How long idle blocking threads stay alive in seconds (default: 60)
    #[serde(default = "default_thread_keep_alive")]
    pub thread_keep_alive_secs: u64,

    /// Maximum requests pipelined on one upstream connection (default: 10)
    #[serde(default = "default_pipeline_depth")]
    pub pipeline_depth: usize,

    /// Upper bound for any single network wait in seconds (default: 40)
    #[serde(default = "default_network_timeout")]
    pub network_timeout_secs: u64,

    /// Connection attempts per backend before it is blacklisted (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Redirects followed per download (default: 5)
    #[serde(default = "default_redirect_max")]
    pub redirect_max: u32,

    /// How long a failed backend is skipped in seconds (default: 300)
    #[serde(default = "default_blacklist_duration")]
    pub blacklist_duration_secs: u64,

    /// Grace period for keeping released entries warm in seconds (default: 5)
    #[serde(default = "default_idle_grace")]
    pub idle_grace_secs: u64,

    /// Entries smaller than this are kept warm after release (default: 64KB)
    #[serde(default = "default_keep_warm_threshold")]
    pub keep_warm_threshold: u64,

    /// Glob patterns (`*` wildcard) for index files that change upstream
    #[serde(default = "default_volatile_patterns")]
    pub volatile_patterns: Vec<String>,

    /// Age after which a complete volatile file is revalidated (default: 30)
    #[serde(default = "default_volatile_max_age")]
    pub volatile_max_age_secs: u64,

    /// Honour `Cache-Control: no-cache` from clients (default: true)
    #[serde(default = "default_true")]
    pub allow_client_refresh: bool,

    /// Serve absolute-form requests that match no repository (default: true)
    #[serde(default = "default_true")]
    pub allow_direct: bool,

    /// Use sendfile for cached data when the platform supports it (default: true)
    #[serde(default = "default_true")]
    pub zero_copy: bool,

    /// HTTP proxy used for plain-HTTP upstream fetches
    #[serde(default)]
    pub upstream_proxy: Option<String>,

    /// Upstream connection pool limits
    #[serde(default)]
    pub pool: PoolConfig,

    /// User-Agent sent upstream
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Configured repositories with their mirror lists
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// A named repository served from an ordered list of mirrors
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryConfig {
    /// First path component clients use, e.g. `debian`
    pub name: String,

    /// Backend base URLs, tried in order
    pub backends: Vec<String>,

    /// File whose 4xx disqualifies a backend
    #[serde(default)]
    pub marker_file: Option<String>,

    /// URL prefixes that forward-proxy requests are remapped from
    #[serde(default)]
    pub remap_prefixes: Vec<String>,
}

impl RepositoryConfig {
    /// Parse the backend list
    pub fn backend_urls(&self) -> Result<Vec<Url>> {
        self.backends
            .iter()
            .map(|b| {
                let url = Url::parse(b).map_err(|e| {
                    ProxyError::ConfigError(format!(
                        "repository '{}': invalid backend URL '{}': {}",
                        self.name, b, e
                    ))
                })?;
                match url.scheme() {
                    "http" | "https" => Ok(url),
                    other => Err(ProxyError::ConfigError(format!(
                        "repository '{}': unsupported backend scheme '{}'",
                        self.name, other
                    ))),
                }
            })
            .collect()
    }
}

/// Upstream connection pool limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Idle connections kept per host (default: 4)
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Idle connections older than this are closed in seconds (default: 30)
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

// Default value functions for serde
fn default_listen_address() -> String {
    "0.0.0.0:3142".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/pkg-relay")
}

fn default_max_connections() -> usize {
    500
}

fn default_worker_threads() -> usize {
    4
}

fn default_thread_keep_alive() -> u64 {
    60
}

fn default_pipeline_depth() -> usize {
    10
}

fn default_network_timeout() -> u64 {
    40
}

fn default_max_retries() -> usize {
    3
}

fn default_redirect_max() -> u32 {
    5
}

fn default_blacklist_duration() -> u64 {
    300
}

fn default_idle_grace() -> u64 {
    5
}

fn default_keep_warm_threshold() -> u64 {
    64 * 1024
}

fn default_volatile_patterns() -> Vec<String> {
    [
        "*/Release",
        "*/InRelease",
        "*/Release.gpg",
        "*/Packages*",
        "*/Sources*",
        "*/Translation-*",
        "*/Contents-*",
        "*/repomd.xml*",
        "*.db",
        "*.db.sig",
        "*.files",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_volatile_max_age() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    concat!("pkg-relay/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_max_idle_per_host() -> usize {
    4
}

fn default_pool_idle_timeout() -> u64 {
    30
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_address: default_listen_address(),
            cache_dir: default_cache_dir(),
            max_connections: default_max_connections(),
            worker_threads: default_worker_threads(),
            thread_keep_alive_secs: default_thread_keep_alive(),
            pipeline_depth: default_pipeline_depth(),
            network_timeout_secs: default_network_timeout(),
            max_retries: default_max_retries(),
            redirect_max: default_redirect_max(),
            blacklist_duration_secs: default_blacklist_duration(),
            idle_grace_secs: default_idle_grace(),
            keep_warm_threshold: default_keep_warm_threshold(),
            volatile_patterns: default_volatile_patterns(),
            volatile_max_age_secs: default_volatile_max_age(),
            allow_client_refresh: default_true(),
            allow_direct: default_true(),
            zero_copy: default_true(),
            upstream_proxy: None,
            pool: PoolConfig::default(),
            user_agent: default_user_agent(),
            repositories: Vec::new(),
            metrics_endpoint: None,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(ProxyConfig)` if loading and validation succeed
    /// * `Err(ProxyError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ProxyConfig = serde_yaml::from_str(content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - max_connections, worker_threads and pipeline_depth must be > 0
    /// - pipeline_depth must not exceed 64
    /// - network_timeout_secs must be > 0
    /// - repository names must be unique single path components
    /// - every repository needs at least one http/https backend
    /// - upstream_proxy, if set, must be an http URL
    pub fn validate(&self) -> Result<()> {
        const MAX_PIPELINE_DEPTH: usize = 64;

        if self.max_connections == 0 {
            return Err(ProxyError::ConfigError(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.worker_threads == 0 {
            return Err(ProxyError::ConfigError(
                "worker_threads must be greater than 0".to_string(),
            ));
        }

        if self.pipeline_depth == 0 || self.pipeline_depth > MAX_PIPELINE_DEPTH {
            return Err(ProxyError::ConfigError(format!(
                "pipeline_depth must be between 1 and {}, got {}",
                MAX_PIPELINE_DEPTH, self.pipeline_depth
            )));
        }

        if self.network_timeout_secs == 0 {
            return Err(ProxyError::ConfigError(
                "network_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for repo in &self.repositories {
            if repo.name.is_empty() || repo.name.contains('/') || repo.name == ".." {
                return Err(ProxyError::ConfigError(format!(
                    "invalid repository name '{}'",
                    repo.name
                )));
            }
            if !names.insert(repo.name.as_str()) {
                return Err(ProxyError::ConfigError(format!(
                    "duplicate repository '{}'",
                    repo.name
                )));
            }
            if repo.backends.is_empty() {
                return Err(ProxyError::ConfigError(format!(
                    "repository '{}' has no backends",
                    repo.name
                )));
            }
            repo.backend_urls()?;
            for prefix in &repo.remap_prefixes {
                Url::parse(prefix).map_err(|e| {
                    ProxyError::ConfigError(format!(
                        "repository '{}': invalid remap prefix '{}': {}",
                        repo.name, prefix, e
                    ))
                })?;
            }
        }

        if let Some(proxy) = &self.upstream_proxy {
            let url = Url::parse(proxy).map_err(|e| {
                ProxyError::ConfigError(format!("invalid upstream_proxy '{}': {}", proxy, e))
            })?;
            if url.scheme() != "http" || url.host_str().is_none() {
                return Err(ProxyError::ConfigError(format!(
                    "upstream_proxy must be an http:// URL, got '{}'",
                    proxy
                )));
            }
        }

        Ok(())
    }

    /// Look up a repository by name
    pub fn repository(&self, name: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| r.name == name)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn blacklist_duration(&self) -> Duration {
        Duration::from_secs(self.blacklist_duration_secs)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }

    pub fn volatile_max_age(&self) -> Duration {
        Duration::from_secs(self.volatile_max_age_secs)
    }

    /// Parsed upstream proxy URL, if one is configured
    pub fn upstream_proxy_url(&self) -> Option<Url> {
        self.upstream_proxy.as_deref().and_then(|p| Url::parse(p).ok())
    }
}
