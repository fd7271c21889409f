//! Upstream HTTP response state machine
//!
//! The parser is sans-IO: the downloader feeds it whatever bytes arrived and
//! gets back header, body and completion events. Body framing follows
//! Content-Length, chunked transfer coding, or connection close.

use crate::error::{ProxyError, Result};
use crate::header::HttpHeader;
use bytes::{Buf, Bytes, BytesMut};

/// Longest accepted chunk size or trailer line
const MAX_CHUNK_LINE: usize = 4096;

/// Protocol state for one upstream response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Waiting for the status line and headers
    GetHeader,
    /// An interim 1xx response was skipped; waiting for the final header
    ReGetHeader,
    /// Fixed-length body with this many bytes left
    ProcessData(u64),
    /// Body delimited by connection close
    ProcessUntilClose,
    /// Waiting for a chunk size line
    GetChunkHead,
    /// Inside a chunk with this many bytes left
    ProcessChunkData(u64),
    /// Consuming trailer lines after the last chunk
    GetChunkTrailer,
    /// Body complete; `Finished` is reported next
    FinishJob,
    /// Response fully consumed
    Done,
}

/// What the parser produced from the buffered bytes
#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    /// The final response header
    Header(HttpHeader),
    /// A slice of decoded body bytes
    Data(Bytes),
    /// The response is complete
    Finished,
    /// More input is required
    NeedMore,
}

/// Incremental parser for a single upstream response
#[derive(Debug)]
pub struct ResponseParser {
    state: ParseState,
    head_request: bool,
    chunk_crlf_pending: bool,
    keep_alive: bool,
}

impl ResponseParser {
    /// Create a parser for the response to a GET (`head_request = false`)
    /// or HEAD request
    pub fn new(head_request: bool) -> Self {
        ResponseParser {
            state: ParseState::GetHeader,
            head_request,
            chunk_crlf_pending: false,
            keep_alive: true,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Whether the connection can carry another response after this one
    pub fn reusable(&self) -> bool {
        self.keep_alive && self.state == ParseState::Done
    }

    /// Consume bytes from `buf` and return the next event
    pub fn step(&mut self, buf: &mut BytesMut) -> Result<ParseEvent> {
        loop {
            match self.state {
                ParseState::GetHeader | ParseState::ReGetHeader => {
                    let (header, used) = match HttpHeader::parse(buf)? {
                        Some(parsed) => parsed,
                        None => return Ok(ParseEvent::NeedMore),
                    };
                    buf.advance(used);

                    let status = header.status().ok_or_else(|| {
                        ProxyError::ProtocolError("expected a response, got a request".to_string())
                    })?;
                    if (100..200).contains(&status) {
                        self.state = ParseState::ReGetHeader;
                        continue;
                    }

                    self.keep_alive = header.keep_alive();
                    self.state = self.body_state(&header, status);
                    return Ok(ParseEvent::Header(header));
                }
                ParseState::ProcessData(remaining) => {
                    if buf.is_empty() {
                        return Ok(ParseEvent::NeedMore);
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ParseState::FinishJob
                    } else {
                        ParseState::ProcessData(left)
                    };
                    return Ok(ParseEvent::Data(buf.split_to(take).freeze()));
                }
                ParseState::ProcessUntilClose => {
                    if buf.is_empty() {
                        return Ok(ParseEvent::NeedMore);
                    }
                    let all = buf.len();
                    return Ok(ParseEvent::Data(buf.split_to(all).freeze()));
                }
                ParseState::GetChunkHead => {
                    let line = match take_line(buf)? {
                        Some(line) => line,
                        None => return Ok(ParseEvent::NeedMore),
                    };
                    if self.chunk_crlf_pending {
                        if !line.is_empty() {
                            return Err(ProxyError::ProtocolError(
                                "missing CRLF after chunk data".to_string(),
                            ));
                        }
                        self.chunk_crlf_pending = false;
                        continue;
                    }
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        ParseState::GetChunkTrailer
                    } else {
                        ParseState::ProcessChunkData(size)
                    };
                }
                ParseState::ProcessChunkData(remaining) => {
                    if buf.is_empty() {
                        return Ok(ParseEvent::NeedMore);
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.state = ParseState::GetChunkHead;
                        self.chunk_crlf_pending = true;
                    } else {
                        self.state = ParseState::ProcessChunkData(left);
                    }
                    return Ok(ParseEvent::Data(buf.split_to(take).freeze()));
                }
                ParseState::GetChunkTrailer => {
                    let line = match take_line(buf)? {
                        Some(line) => line,
                        None => return Ok(ParseEvent::NeedMore),
                    };
                    if line.is_empty() {
                        self.state = ParseState::FinishJob;
                    }
                }
                ParseState::FinishJob => {
                    self.state = ParseState::Done;
                    return Ok(ParseEvent::Finished);
                }
                ParseState::Done => {
                    return Err(ProxyError::InternalError(
                        "response parser used after completion".to_string(),
                    ));
                }
            }
        }
    }

    /// Report that the upstream closed the connection
    ///
    /// Ends close-delimited bodies; anything else is a lost connection.
    pub fn on_eof(&mut self) -> Result<ParseEvent> {
        match self.state {
            ParseState::ProcessUntilClose | ParseState::FinishJob => {
                self.keep_alive = false;
                self.state = ParseState::Done;
                Ok(ParseEvent::Finished)
            }
            ParseState::GetHeader => Err(ProxyError::ConnectionLost(
                "upstream closed before sending a response".to_string(),
            )),
            state => Err(ProxyError::ConnectionLost(format!(
                "upstream closed mid-response in state {:?}",
                state
            ))),
        }
    }

    fn body_state(&mut self, header: &HttpHeader, status: u16) -> ParseState {
        if self.head_request || status == 204 || status == 304 {
            return ParseState::FinishJob;
        }
        if header.is_chunked() {
            self.chunk_crlf_pending = false;
            return ParseState::GetChunkHead;
        }
        match header.content_length() {
            Some(0) => ParseState::FinishJob,
            Some(len) => ParseState::ProcessData(len),
            None => {
                self.keep_alive = false;
                ParseState::ProcessUntilClose
            }
        }
    }
}

fn take_line(buf: &mut BytesMut) -> Result<Option<String>> {
    match buf.iter().position(|b| *b == b'\n') {
        Some(pos) => {
            if pos > MAX_CHUNK_LINE {
                return Err(ProxyError::ProtocolError("chunk line too long".to_string()));
            }
            let line = buf.split_to(pos + 1);
            let text = std::str::from_utf8(&line)
                .map_err(|_| ProxyError::ProtocolError("chunk line is not UTF-8".to_string()))?;
            Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
        }
        None if buf.len() > MAX_CHUNK_LINE => {
            Err(ProxyError::ProtocolError("chunk line too long".to_string()))
        }
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &str) -> Result<u64> {
    let size = line.split(';').next().unwrap_or_default().trim();
    if size.is_empty() {
        return Err(ProxyError::ProtocolError("empty chunk size".to_string()));
    }
    u64::from_str_radix(size, 16)
        .map_err(|_| ProxyError::ProtocolError(format!("invalid chunk size: {:?}", size)))
}

/// Drive a parser over a complete buffer and collect the decoded body
#[cfg(test)]
pub(crate) fn decode_all(parser: &mut ResponseParser, input: &[u8]) -> Result<(HttpHeader, Vec<u8>)> {
    let mut buf = BytesMut::from(input);
    let mut header = None;
    let mut body = Vec::new();
    loop {
        match parser.step(&mut buf)? {
            ParseEvent::Header(h) => header = Some(h),
            ParseEvent::Data(d) => body.extend_from_slice(&d),
            ParseEvent::Finished => break,
            ParseEvent::NeedMore => {
                parser.on_eof()?;
                break;
            }
        }
    }
    let header = header.ok_or_else(|| ProxyError::ProtocolError("no header".to_string()))?;
    Ok((header, body))
}
