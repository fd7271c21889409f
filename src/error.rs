//! Error types for the caching proxy

use nix::errno::Errno;
use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error types that can occur while serving or downloading
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Malformed request or response framing
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Upstream returned {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("Redirect loop detected")]
    RedirectLoop,

    /// Cached prefix and upstream response disagree
    #[error("Resume mismatch: {0}")]
    ResumeMismatch(String),

    #[error("Range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    #[error("Cache storage error: {0}")]
    StorageError(String),

    #[error("Disk full: {0}")]
    DiskFull(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("No usable backend: {0}")]
    BackendsExhausted(String),

    /// The entry was completed or taken over by another download agent
    #[error("Download collision on {0}")]
    Collision(String),

    #[error("Shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => ProxyError::Timeout(err.to_string()),
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => ProxyError::ConnectionLost(err.to_string()),
            _ => ProxyError::IoError(err.to_string()),
        }
    }
}

impl ProxyError {
    /// Classify an I/O error raised by cache storage
    ///
    /// Disk exhaustion gets its own variant so that clients and logs can
    /// tell it apart from permission or consistency problems.
    pub fn from_storage_io(context: &str, err: &std::io::Error) -> Self {
        let no_space = err.raw_os_error() == Some(Errno::ENOSPC as i32)
            || err.raw_os_error() == Some(Errno::EDQUOT as i32);
        if no_space {
            ProxyError::DiskFull(format!("{}: {}", context, err))
        } else {
            ProxyError::StorageError(format!("{}: {}", context, err))
        }
    }

    /// Determine if this error should trigger a retry against the same backend
    ///
    /// Transient network conditions and upstream server errors are retried;
    /// protocol violations, client errors and local storage failures are not.
    pub fn should_retry(&self) -> bool {
        match self {
            ProxyError::ConnectionLost(_) => true,
            ProxyError::ConnectFailed(_) => true,
            ProxyError::Timeout(_) => true,
            ProxyError::IoError(_) => true,
            ProxyError::UpstreamStatus { status, .. } => *status >= 500,

            ProxyError::ConfigError(_) => false,
            ProxyError::ProtocolError(_) => false,
            ProxyError::BadRequest(_) => false,
            ProxyError::Forbidden(_) => false,
            ProxyError::MethodNotAllowed(_) => false,
            ProxyError::RedirectLoop => false,
            ProxyError::ResumeMismatch(_) => false,
            ProxyError::RangeNotSatisfiable(_) => false,
            ProxyError::StorageError(_) => false,
            ProxyError::DiskFull(_) => false,
            ProxyError::BackendsExhausted(_) => false,
            ProxyError::Collision(_) => false,
            ProxyError::Shutdown => false,
            ProxyError::InternalError(_) => false,
        }
    }

    /// Whether the failing backend should be skipped in favour of the next mirror
    pub fn should_failover(&self) -> bool {
        match self {
            ProxyError::ConnectFailed(_) | ProxyError::Timeout(_) => true,
            ProxyError::ConnectionLost(_) | ProxyError::ProtocolError(_) => true,
            ProxyError::UpstreamStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Convert error to the HTTP status code reported to clients
    ///
    /// - Upstream 4xx: passed through
    /// - Upstream 5xx and broken upstream framing: 502 Bad Gateway
    /// - Timeouts: 504 Gateway Timeout
    /// - Storage failures: 503, or 507 when the disk is full
    pub fn to_http_status(&self) -> u16 {
        match self {
            ProxyError::UpstreamStatus { status, .. } if (400..500).contains(status) => *status,
            ProxyError::UpstreamStatus { .. } => 502,

            ProxyError::BadRequest(_) => 400,
            ProxyError::Forbidden(_) => 403,
            ProxyError::MethodNotAllowed(_) => 405,
            ProxyError::RangeNotSatisfiable(_) => 416,

            ProxyError::ProtocolError(_) => 502,
            ProxyError::ConnectionLost(_) => 502,
            ProxyError::ConnectFailed(_) => 502,
            ProxyError::BackendsExhausted(_) => 502,
            ProxyError::ResumeMismatch(_) => 502,
            ProxyError::Collision(_) => 502,
            ProxyError::Timeout(_) => 504,
            ProxyError::RedirectLoop => 508,

            ProxyError::DiskFull(_) => 507,
            ProxyError::StorageError(_) => 503,
            ProxyError::Shutdown => 503,

            ProxyError::ConfigError(_) => 500,
            ProxyError::IoError(_) => 500,
            ProxyError::InternalError(_) => 500,
        }
    }

    /// Create an error from an upstream HTTP status code
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        ProxyError::UpstreamStatus {
            status,
            message: message.into(),
        }
    }

    /// Reason phrase for a synthesized status line
    ///
    /// Only upstream reasons are relayed, stripped of control characters;
    /// every other error gets a fixed phrase so no request bytes or local
    /// details end up in the status line.
    pub fn status_message(&self) -> String {
        match self {
            ProxyError::UpstreamStatus { message, .. } => {
                let clean: String = message.chars().filter(|c| !c.is_control()).collect();
                match clean.trim() {
                    "" => canonical_reason(self.to_http_status()).to_string(),
                    reason => reason.to_string(),
                }
            }
            ProxyError::RedirectLoop => "Redirection loop".to_string(),
            ProxyError::DiskFull(_) => "Cache disk full".to_string(),
            ProxyError::StorageError(_) => "Cache storage error".to_string(),
            other => canonical_reason(other.to_http_status()).to_string(),
        }
    }
}

fn canonical_reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("Error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enospc_is_disk_full() {
        let err = std::io::Error::from_raw_os_error(Errno::ENOSPC as i32);
        let mapped = ProxyError::from_storage_io("write", &err);
        assert!(matches!(mapped, ProxyError::DiskFull(_)));
        assert_eq!(mapped.to_http_status(), 507);
    }

    #[test]
    fn test_eacces_is_storage_error() {
        let err = std::io::Error::from_raw_os_error(Errno::EACCES as i32);
        let mapped = ProxyError::from_storage_io("open", &err);
        assert!(matches!(mapped, ProxyError::StorageError(_)));
        assert_eq!(mapped.to_http_status(), 503);
    }

    #[test]
    fn test_io_kind_mapping() {
        let err: ProxyError = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert!(matches!(err, ProxyError::Timeout(_)));
        let err: ProxyError = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(matches!(err, ProxyError::ConnectionLost(_)));
    }

    #[test]
    fn test_status_message_hides_details() {
        let err = ProxyError::BadRequest("malformed header line: No\rColon".to_string());
        assert_eq!(err.to_http_status(), 400);
        assert_eq!(err.status_message(), "Bad Request");

        let err = ProxyError::ConnectFailed("10.0.0.7:80: refused".to_string());
        assert_eq!(err.status_message(), "Bad Gateway");
        assert_eq!(ProxyError::Shutdown.status_message(), "Service Unavailable");

        let err = ProxyError::from_http_status(404, "Not\r\nFound");
        assert_eq!(err.status_message(), "NotFound");
        assert_eq!(ProxyError::from_http_status(503, "").status_message(), "Bad Gateway");
    }

    #[test]
    fn test_should_failover() {
        assert!(ProxyError::from_http_status(503, "Busy").should_failover());
        assert!(!ProxyError::from_http_status(404, "Not Found").should_failover());
        assert!(ProxyError::ConnectFailed("refused".to_string()).should_failover());
        assert!(!ProxyError::DiskFull("write".to_string()).should_failover());
    }
}
