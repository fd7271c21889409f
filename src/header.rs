//! HTTP/1.x header block codec
//!
//! Parses and serializes request and response header blocks into a fixed set
//! of well-known fields. Anything else is kept verbatim so it can be passed
//! through. The codec is pure: it never touches sockets or files.

use crate::error::{ProxyError, Result};
use chrono::{DateTime, Utc};
use http::{Method, StatusCode};
use std::fmt;
use std::time::SystemTime;

/// Upper bound for a header block; larger blocks are treated as malformed
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Header fields the proxy understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderField {
    Host,
    Range,
    IfRange,
    IfModifiedSince,
    Connection,
    ProxyConnection,
    ContentLength,
    TransferEncoding,
    Authorization,
    XForwardedFor,
    Location,
    ContentType,
    ContentRange,
    LastModified,
    XOriginalSource,
}

const FIELD_COUNT: usize = 15;

impl HeaderField {
    pub const ALL: [HeaderField; FIELD_COUNT] = [
        HeaderField::Host,
        HeaderField::Range,
        HeaderField::IfRange,
        HeaderField::IfModifiedSince,
        HeaderField::Connection,
        HeaderField::ProxyConnection,
        HeaderField::ContentLength,
        HeaderField::TransferEncoding,
        HeaderField::Authorization,
        HeaderField::XForwardedFor,
        HeaderField::Location,
        HeaderField::ContentType,
        HeaderField::ContentRange,
        HeaderField::LastModified,
        HeaderField::XOriginalSource,
    ];

    /// Canonical spelling used when serializing
    pub fn name(self) -> &'static str {
        match self {
            HeaderField::Host => "Host",
            HeaderField::Range => "Range",
            HeaderField::IfRange => "If-Range",
            HeaderField::IfModifiedSince => "If-Modified-Since",
            HeaderField::Connection => "Connection",
            HeaderField::ProxyConnection => "Proxy-Connection",
            HeaderField::ContentLength => "Content-Length",
            HeaderField::TransferEncoding => "Transfer-Encoding",
            HeaderField::Authorization => "Authorization",
            HeaderField::XForwardedFor => "X-Forwarded-For",
            HeaderField::Location => "Location",
            HeaderField::ContentType => "Content-Type",
            HeaderField::ContentRange => "Content-Range",
            HeaderField::LastModified => "Last-Modified",
            HeaderField::XOriginalSource => "X-Original-Source",
        }
    }

    /// Case-insensitive lookup of a field name
    pub fn from_name(name: &str) -> Option<Self> {
        HeaderField::ALL
            .iter()
            .copied()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Protocol version from the front line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.1" => Ok(HttpVersion::Http11),
            "HTTP/1.0" => Ok(HttpVersion::Http10),
            other => Err(ProxyError::ProtocolError(format!(
                "unsupported protocol version: {}",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

/// What kind of message the front line describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Request { method: Method, target: String },
    Answer { status: u16, reason: String },
}

/// A parsed header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    kind: MessageKind,
    version: HttpVersion,
    fields: [Option<String>; FIELD_COUNT],
    extra: Vec<(String, String)>,
}

impl HttpHeader {
    /// A request header with an empty field set
    pub fn request(method: Method, target: impl Into<String>, version: HttpVersion) -> Self {
        HttpHeader {
            kind: MessageKind::Request {
                method,
                target: target.into(),
            },
            version,
            fields: Default::default(),
            extra: Vec::new(),
        }
    }

    /// A response header with the given status and reason phrase
    pub fn answer(status: u16, reason: impl Into<String>) -> Self {
        HttpHeader {
            kind: MessageKind::Answer {
                status,
                reason: reason.into(),
            },
            version: HttpVersion::Http11,
            fields: Default::default(),
            extra: Vec::new(),
        }
    }

    /// A response header using the canonical reason phrase for `status`
    pub fn answer_for(status: u16) -> Self {
        let reason = StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown");
        HttpHeader::answer(status, reason)
    }

    /// Parse a header block from the start of `buf`
    ///
    /// # Returns
    /// * `Ok(Some((header, consumed)))` once a complete block is available;
    ///   `consumed` includes the terminating empty line
    /// * `Ok(None)` if more bytes are needed
    /// * `Err(ProxyError::ProtocolError)` for malformed or oversized blocks
    pub fn parse(buf: &[u8]) -> Result<Option<(HttpHeader, usize)>> {
        // Tolerate stray line breaks between pipelined messages
        let skip = buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        let body = &buf[skip..];

        let end = match find_header_end(body) {
            Some(end) => end,
            None => {
                if body.len() > MAX_HEADER_SIZE {
                    return Err(ProxyError::ProtocolError(format!(
                        "header block exceeds {} bytes",
                        MAX_HEADER_SIZE
                    )));
                }
                return Ok(None);
            }
        };

        if end.block_len > MAX_HEADER_SIZE {
            return Err(ProxyError::ProtocolError(format!(
                "header block exceeds {} bytes",
                MAX_HEADER_SIZE
            )));
        }

        let text = std::str::from_utf8(&body[..end.block_len])
            .map_err(|_| ProxyError::ProtocolError("header is not valid UTF-8".to_string()))?;

        let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
        let front = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| ProxyError::ProtocolError("missing front line".to_string()))?;

        let (kind, version) = parse_front_line(front)?;
        let mut header = HttpHeader {
            kind,
            version,
            fields: Default::default(),
            extra: Vec::new(),
        };

        let mut last_extra: Option<usize> = None;
        let mut last_field: Option<HeaderField> = None;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                // obs-fold continuation
                let cont = line.trim();
                if let Some(field) = last_field {
                    if let Some(v) = header.fields[field.index()].as_mut() {
                        v.push(' ');
                        v.push_str(cont);
                    }
                } else if let Some(idx) = last_extra {
                    header.extra[idx].1.push(' ');
                    header.extra[idx].1.push_str(cont);
                } else {
                    return Err(ProxyError::ProtocolError(
                        "continuation line without a header".to_string(),
                    ));
                }
                continue;
            }

            let (name, value) = line.split_once(':').ok_or_else(|| {
                ProxyError::ProtocolError(format!("malformed header line: {}", line))
            })?;
            if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
                return Err(ProxyError::ProtocolError(format!(
                    "malformed header name: {:?}",
                    name
                )));
            }
            let value = value.trim();

            match HeaderField::from_name(name) {
                Some(field) => {
                    header.merge_field(field, value)?;
                    last_field = Some(field);
                    last_extra = None;
                }
                None => {
                    header.extra.push((name.to_string(), value.to_string()));
                    last_extra = Some(header.extra.len() - 1);
                    last_field = None;
                }
            }
        }

        if let Some(cl) = header.get(HeaderField::ContentLength) {
            if cl.parse::<u64>().is_err() {
                return Err(ProxyError::ProtocolError(format!(
                    "invalid Content-Length: {}",
                    cl
                )));
            }
        }

        Ok(Some((header, skip + end.total_len)))
    }

    fn merge_field(&mut self, field: HeaderField, value: &str) -> Result<()> {
        let slot = &mut self.fields[field.index()];
        match (field, slot.as_mut()) {
            (HeaderField::XForwardedFor, Some(existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            (HeaderField::ContentLength, Some(existing)) if existing != value => {
                return Err(ProxyError::ProtocolError(format!(
                    "conflicting Content-Length values: {} and {}",
                    existing, value
                )));
            }
            _ => *slot = Some(value.to_string()),
        }
        Ok(())
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn set_version(&mut self, version: HttpVersion) {
        self.version = version;
    }

    /// Request method, `None` for answers
    pub fn method(&self) -> Option<&Method> {
        match &self.kind {
            MessageKind::Request { method, .. } => Some(method),
            MessageKind::Answer { .. } => None,
        }
    }

    /// Request target as written on the request line
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Request { target, .. } => Some(target),
            MessageKind::Answer { .. } => None,
        }
    }

    /// Status code, `None` for requests
    pub fn status(&self) -> Option<u16> {
        match &self.kind {
            MessageKind::Answer { status, .. } => Some(*status),
            MessageKind::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Answer { reason, .. } => Some(reason),
            MessageKind::Request { .. } => None,
        }
    }

    /// The serialized front line without line terminator
    pub fn front_line(&self) -> String {
        match &self.kind {
            MessageKind::Request { method, target } => {
                format!("{} {} {}", method, target, self.version.as_str())
            }
            MessageKind::Answer { status, reason } => {
                format!("{} {} {}", self.version.as_str(), status, reason)
            }
        }
    }

    pub fn get(&self, field: HeaderField) -> Option<&str> {
        self.fields[field.index()].as_deref()
    }

    pub fn set(&mut self, field: HeaderField, value: impl Into<String>) {
        self.fields[field.index()] = Some(value.into());
    }

    pub fn remove(&mut self, field: HeaderField) -> Option<String> {
        self.fields[field.index()].take()
    }

    /// Look up a header outside the well-known set (case-insensitive)
    pub fn get_extra(&self, name: &str) -> Option<&str> {
        self.extra
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Add or replace a header outside the well-known set
    pub fn set_extra(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.extra.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(slot) => slot.1 = value,
            None => self.extra.push((name.to_string(), value)),
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get(HeaderField::ContentLength)
            .and_then(|v| v.parse().ok())
    }

    /// Whether the body uses chunked transfer coding
    pub fn is_chunked(&self) -> bool {
        self.get(HeaderField::TransferEncoding)
            .and_then(|te| te.rsplit(',').next())
            .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    /// Whether the peer wants the connection kept open after this message
    pub fn keep_alive(&self) -> bool {
        let token = self
            .get(HeaderField::Connection)
            .or_else(|| self.get(HeaderField::ProxyConnection));
        match token {
            Some(v) if has_token(v, "close") => false,
            Some(v) if has_token(v, "keep-alive") => true,
            _ => self.version >= HttpVersion::Http11,
        }
    }

    /// Whether the client asked to bypass cached copies
    pub fn wants_refresh(&self) -> bool {
        let no_cache = |v: &str| has_token(v, "no-cache");
        self.get_extra("Cache-Control").map(no_cache).unwrap_or(false)
            || self.get_extra("Pragma").map(no_cache).unwrap_or(false)
    }

    /// Serialize the header block including the terminating empty line
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for HttpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\r\n", self.front_line())?;
        for field in HeaderField::ALL {
            if let Some(v) = self.get(field) {
                write!(f, "{}: {}\r\n", field.name(), v)?;
            }
        }
        for (name, value) in &self.extra {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        write!(f, "\r\n")
    }
}

struct HeaderEnd {
    /// Length of the block up to (not including) the final empty line
    block_len: usize,
    /// Length including the terminating empty line
    total_len: usize,
}

fn find_header_end(buf: &[u8]) -> Option<HeaderEnd> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => {
                    return Some(HeaderEnd {
                        block_len: i + 1,
                        total_len: i + 2,
                    })
                }
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => {
                    return Some(HeaderEnd {
                        block_len: i + 1,
                        total_len: i + 3,
                    })
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn parse_front_line(line: &str) -> Result<(MessageKind, HttpVersion)> {
    if line.starts_with("HTTP/") {
        let mut parts = line.splitn(3, ' ');
        let version = HttpVersion::parse(parts.next().unwrap_or_default())?;
        let code = parts.next().unwrap_or_default();
        if code.len() != 3 {
            return Err(ProxyError::ProtocolError(format!("invalid status line: {}", line)));
        }
        let status = code
            .parse::<u16>()
            .ok()
            .filter(|s| (100..600).contains(s))
            .ok_or_else(|| ProxyError::ProtocolError(format!("invalid status code: {}", code)))?;
        let reason = parts.next().unwrap_or_default().trim().to_string();
        Ok((MessageKind::Answer { status, reason }, version))
    } else {
        let mut parts = line.split_whitespace();
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v), None) => (m, t, v),
            _ => {
                return Err(ProxyError::ProtocolError(format!(
                    "malformed request line: {}",
                    line
                )))
            }
        };
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ProxyError::ProtocolError(format!("invalid method: {}", method)))?;
        let version = HttpVersion::parse(version)?;
        Ok((
            MessageKind::Request {
                method,
                target: target.to_string(),
            },
            version,
        ))
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Parse an HTTP date (IMF-fixdate; RFC 2822 compatible)
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Format a timestamp as an IMF-fixdate
pub fn format_http_date(time: SystemTime) -> String {
    let dt: DateTime<Utc> = time.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
