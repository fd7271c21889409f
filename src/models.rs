//! Byte range models shared by the client and upstream sides

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};

/// A resolved, inclusive byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Starting byte position (inclusive)
    pub start: u64,
    /// Ending byte position (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Create a new ByteRange
    ///
    /// # Returns
    /// * `Ok(ByteRange)` if the range is valid
    /// * `Err(ProxyError)` if start > end
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(ProxyError::RangeNotSatisfiable(format!(
                "start ({}) must be <= end ({})",
                start, end
            )));
        }
        Ok(ByteRange { start, end })
    }

    /// Get the size of this byte range in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Exclusive end offset
    pub fn end_exclusive(&self) -> u64 {
        self.end + 1
    }

    /// Content-Range value for this range within a resource of `total` bytes
    pub fn to_content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// A single client byte range as written in a Range header, before it is
/// resolved against the resource length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// `bytes=a-b`
    FromTo(u64, u64),
    /// `bytes=a-`
    From(u64),
    /// `bytes=-n`, the last n bytes
    Suffix(u64),
}

impl RangeRequest {
    /// Parse a Range header value
    ///
    /// Only single ranges are understood; multi-range requests are rejected
    /// so the caller can fall back to a full response.
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let spec = header
            .strip_prefix("bytes=")
            .ok_or_else(|| ProxyError::BadRequest(format!("unsupported range unit: {}", header)))?;

        if spec.contains(',') {
            return Err(ProxyError::BadRequest(format!(
                "multiple ranges are not supported: {}",
                spec
            )));
        }

        let (first, last) = spec
            .split_once('-')
            .ok_or_else(|| ProxyError::BadRequest(format!("invalid range: {}", spec)))?;
        let (first, last) = (first.trim(), last.trim());

        let parse = |v: &str| {
            v.parse::<u64>()
                .map_err(|e| ProxyError::BadRequest(format!("invalid range value '{}': {}", v, e)))
        };

        match (first.is_empty(), last.is_empty()) {
            (true, true) => Err(ProxyError::BadRequest("empty range".to_string())),
            (true, false) => Ok(RangeRequest::Suffix(parse(last)?)),
            (false, true) => Ok(RangeRequest::From(parse(first)?)),
            (false, false) => {
                let (start, end) = (parse(first)?, parse(last)?);
                if start > end {
                    return Err(ProxyError::BadRequest(format!(
                        "range start {} after end {}",
                        start, end
                    )));
                }
                Ok(RangeRequest::FromTo(start, end))
            }
        }
    }

    /// Resolve against the total resource length
    ///
    /// Returns `None` when the range is unsatisfiable (starts at or beyond
    /// the end, or asks for an empty suffix). The end is clipped to the
    /// last byte of the resource.
    pub fn resolve(&self, total: u64) -> Option<ByteRange> {
        if total == 0 {
            return None;
        }
        let last = total - 1;
        match *self {
            RangeRequest::FromTo(start, end) if start <= last => Some(ByteRange {
                start,
                end: end.min(last),
            }),
            RangeRequest::From(start) if start <= last => Some(ByteRange { start, end: last }),
            RangeRequest::Suffix(n) if n > 0 => Some(ByteRange {
                start: total - n.min(total),
                end: last,
            }),
            _ => None,
        }
    }
}

/// A parsed Content-Range response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// The range carried by the response, absent for `bytes */total`
    pub range: Option<ByteRange>,
    /// Total length of the resource, absent for `.../*`
    pub total: Option<u64>,
}

impl ContentRange {
    /// Parse a Content-Range header value ("bytes 0-1023/10240", "bytes */10240")
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let rest = value.strip_prefix("bytes ").ok_or_else(|| {
            ProxyError::ProtocolError(format!(
                "Content-Range must start with 'bytes ', got: {}",
                value
            ))
        })?;

        let (range_part, total_part) = rest.split_once('/').ok_or_else(|| {
            ProxyError::ProtocolError(format!("Invalid Content-Range format: {}", rest))
        })?;

        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| ProxyError::ProtocolError(format!("Invalid Content-Range value '{}': {}", v, e)))
        };

        let total = match total_part.trim() {
            "*" => None,
            t => Some(parse(t)?),
        };

        let range = match range_part.trim() {
            "*" => None,
            r => {
                let (start, end) = r.split_once('-').ok_or_else(|| {
                    ProxyError::ProtocolError(format!("Invalid range in Content-Range: {}", r))
                })?;
                let range = ByteRange::new(parse(start)?, parse(end)?)
                    .map_err(|_| ProxyError::ProtocolError(format!("Inverted Content-Range: {}", r)))?;
                if let Some(total) = total {
                    if range.end >= total {
                        return Err(ProxyError::ProtocolError(format!(
                            "Content-Range end beyond total: {}",
                            value
                        )));
                    }
                }
                Some(range)
            }
        };

        Ok(ContentRange { range, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_range_new() {
        let range = ByteRange::new(0, 1023).unwrap();
        assert_eq!(range.start, 0);
        assert_eq!(range.end, 1023);
        assert_eq!(range.size(), 1024);
    }

    #[test]
    fn test_byte_range_invalid() {
        assert!(ByteRange::new(100, 50).is_err());
    }

    #[test]
    fn test_closed_range_parse() {
        let req = RangeRequest::parse("bytes=0-1023").unwrap();
        assert_eq!(req, RangeRequest::FromTo(0, 1023));
        assert_eq!(req.resolve(4096), Some(ByteRange { start: 0, end: 1023 }));
        assert!(RangeRequest::parse("bytes=10-5").is_err());
    }

    #[test]
    fn test_open_range_resolves_to_end() {
        let req = RangeRequest::parse("bytes=50000-").unwrap();
        assert_eq!(req, RangeRequest::From(50000));
        let resolved = req.resolve(100_000).unwrap();
        assert_eq!(resolved.to_content_range(100_000), "bytes 50000-99999/100000");
        assert_eq!(resolved.size(), 50000);
    }

    #[test]
    fn test_range_beyond_length_is_unsatisfiable() {
        let req = RangeRequest::parse("bytes=150000-").unwrap();
        assert!(req.resolve(100_000).is_none());
        assert!(RangeRequest::From(100_000).resolve(100_000).is_none());
    }

    #[test]
    fn test_closed_range_is_clipped() {
        let req = RangeRequest::parse("bytes=90-500").unwrap();
        assert_eq!(req.resolve(100), Some(ByteRange { start: 90, end: 99 }));
    }

    #[test]
    fn test_suffix_range() {
        let req = RangeRequest::parse("bytes=-10").unwrap();
        assert_eq!(req.resolve(100), Some(ByteRange { start: 90, end: 99 }));
        assert_eq!(req.resolve(5), Some(ByteRange { start: 0, end: 4 }));
        assert!(RangeRequest::Suffix(0).resolve(5).is_none());
    }

    #[test]
    fn test_multi_range_rejected() {
        assert!(RangeRequest::parse("bytes=0-1,5-6").is_err());
        assert!(RangeRequest::parse("items=0-1").is_err());
        assert!(RangeRequest::parse("bytes=-").is_err());
    }

    #[test]
    fn test_content_range_parse() {
        let cr = ContentRange::parse("bytes 59999-99999/100000").unwrap();
        assert_eq!(cr.range, Some(ByteRange { start: 59999, end: 99999 }));
        assert_eq!(cr.total, Some(100_000));

        let cr = ContentRange::parse("bytes */100000").unwrap();
        assert!(cr.range.is_none());
        assert_eq!(cr.total, Some(100_000));

        assert!(ContentRange::parse("bytes 0-100/50").is_err());
        assert!(ContentRange::parse("0-100/50").is_err());
    }
}
