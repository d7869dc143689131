//! HTTP/1.1 origin connection
//!
//! Serializes relayed requests onto an HTTP/1.1 origin and incrementally
//! parses the response into [`OriginEvent`]s. Response bodies may be
//! length-delimited, chunked, or EOF-delimited; 101 responses and 2xx
//! answers to CONNECT switch the parser into opaque tunnel mode.

use super::{OriginError, OriginEvent, OriginRequest, ResponseHead, Result};
use crate::h2::ErrorCode;
use crate::http::{self, Headers, Status, Version, CRLF};
use bytes::{Buf, Bytes, BytesMut};

/// Request headers never forwarded to an HTTP/1.1 origin
///
/// Connection-specific headers are re-derived per hop; `host` is written
/// from the request authority.
const DROP_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "host",
];

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParseState {
    StatusLine,
    Headers,
    BodyContentLength { remaining: u64 },
    BodyChunked,
    BodyToEof,
    Tunnel,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    Size,
    Data,
    DataEnd,
    Trailer,
}

/// An HTTP/1.1 origin connection
pub struct H1Origin {
    stream_id: Option<u32>,
    output: BytesMut,
    input: BytesMut,
    paused: bool,
    nodelay: bool,
    /// Parse failure held back until already-parsed events are delivered
    poisoned: Option<String>,

    // request context needed to frame the response
    head_request: bool,
    connect_request: bool,

    state: ParseState,
    status: Option<Status>,
    version: Version,
    headers: Headers,
    chunk_state: ChunkState,
    chunk_size: u64,
    chunk_read: u64,
}

impl H1Origin {
    /// Create a connection for a freshly opened origin transport
    pub fn new() -> Self {
        H1Origin {
            stream_id: None,
            output: BytesMut::new(),
            input: BytesMut::new(),
            paused: false,
            nodelay: false,
            poisoned: None,
            head_request: false,
            connect_request: false,
            state: ParseState::StatusLine,
            status: None,
            version: Version::Http11,
            headers: Headers::new(),
            chunk_state: ChunkState::Size,
            chunk_size: 0,
            chunk_read: 0,
        }
    }

    /// Whether TCP_NODELAY has been requested on the transport
    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    fn write_line(&mut self, line: &str) {
        self.output.extend_from_slice(line.as_bytes());
        self.output.extend_from_slice(CRLF.as_bytes());
    }

    fn find_crlf(buf: &[u8]) -> Option<usize> {
        buf.windows(2).position(|w| w == b"\r\n")
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = Self::find_crlf(&self.input)?;
        let line = String::from_utf8_lossy(&self.input[..pos]).to_string();
        self.input.advance(pos + 2);
        Some(line)
    }

    /// Parse `VERSION STATUS REASON`
    fn parse_status_line(line: &str) -> http::Result<(Version, Status)> {
        let mut parts = line.splitn(3, ' ');
        let version = Version::from_str(parts.next().unwrap_or_default())?;
        let code_str = parts.next().unwrap_or_default();
        let code = code_str
            .parse::<u16>()
            .map_err(|_| http::Error::Parse(format!("Invalid status code: {}", code_str)))?;
        let status = Status::new(code)?;
        Ok((version, status))
    }

    fn finish_headers(&mut self, events: &mut Vec<OriginEvent>) -> Result<()> {
        let status = self.status.expect("status parsed before headers finish");

        // 1xx other than 101 is interim; discard and parse the next head.
        if status.is_informational() && status.code() != 101 {
            self.headers = Headers::new();
            self.status = None;
            self.state = ParseState::StatusLine;
            return Ok(());
        }

        let tunnel = status.code() == 101 || (self.connect_request && status.is_success());

        let connection_close = self
            .headers
            .get("connection")
            .map(|v| v.to_ascii_lowercase().contains("close"))
            .unwrap_or(self.version == Version::Http10);

        let chunked = self
            .headers
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        let content_length = match self.headers.get_unique("content-length") {
            Some(v) => Some(v.trim().parse::<u64>().map_err(|_| {
                OriginError::Parse(http::Error::Parse(format!(
                    "Invalid Content-Length: {}",
                    v
                )))
            })?),
            None => None,
        };

        let head = ResponseHead {
            status,
            version: self.version,
            headers: std::mem::take(&mut self.headers),
            connection_close,
            tunnel,
        };
        events.push(OriginEvent::HeadersComplete(head));

        self.state = if tunnel {
            ParseState::Tunnel
        } else if self.head_request || status.is_bodyless() {
            events.push(OriginEvent::BodyComplete);
            ParseState::Complete
        } else if chunked {
            self.chunk_state = ChunkState::Size;
            ParseState::BodyChunked
        } else if let Some(len) = content_length {
            if len == 0 {
                events.push(OriginEvent::BodyComplete);
                ParseState::Complete
            } else {
                ParseState::BodyContentLength { remaining: len }
            }
        } else {
            // Delimited by connection close; completion arrives as EOF.
            ParseState::BodyToEof
        };
        Ok(())
    }

    fn parse_chunked(&mut self, events: &mut Vec<OriginEvent>) -> Result<bool> {
        loop {
            match self.chunk_state {
                ChunkState::Size => {
                    let Some(line) = self.take_line() else {
                        return Ok(false);
                    };
                    let size_str = line.split(';').next().unwrap_or_default().trim();
                    self.chunk_size = u64::from_str_radix(size_str, 16).map_err(|_| {
                        OriginError::Parse(http::Error::InvalidChunkSize(size_str.to_string()))
                    })?;
                    self.chunk_read = 0;
                    self.chunk_state = if self.chunk_size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data
                    };
                }
                ChunkState::Data => {
                    if self.input.is_empty() {
                        return Ok(false);
                    }
                    let want = (self.chunk_size - self.chunk_read) as usize;
                    let take = std::cmp::min(want, self.input.len());
                    let data = self.input.split_to(take).freeze();
                    self.chunk_read += take as u64;
                    events.push(OriginEvent::Body(data));
                    if self.chunk_read == self.chunk_size {
                        self.chunk_state = ChunkState::DataEnd;
                    } else {
                        return Ok(false);
                    }
                }
                ChunkState::DataEnd => {
                    if self.input.len() < 2 {
                        return Ok(false);
                    }
                    if &self.input[..2] != b"\r\n" {
                        return Err(OriginError::Parse(http::Error::Protocol(
                            "Expected CRLF after chunk".to_string(),
                        )));
                    }
                    self.input.advance(2);
                    self.chunk_state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    if self.input.len() < 2 {
                        return Ok(false);
                    }
                    if &self.input[..2] == b"\r\n" {
                        self.input.advance(2);
                        return Ok(true);
                    }
                    // Trailer header line; dropped (pass-through only).
                    let Some(_line) = self.take_line() else {
                        return Ok(false);
                    };
                }
            }
        }
    }
}

impl H1Origin {
    fn parse_events(&mut self, events: &mut Vec<OriginEvent>) -> Result<()> {
        loop {
            match self.state {
                ParseState::StatusLine => {
                    let Some(line) = self.take_line() else {
                        return Ok(());
                    };
                    let (version, status) = Self::parse_status_line(&line)?;
                    self.version = version;
                    self.status = Some(status);
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(line) = self.take_line() else {
                        return Ok(());
                    };
                    if line.is_empty() {
                        self.finish_headers(events)?;
                        continue;
                    }
                    let (name, value) = Headers::parse_header_line(&line)?;
                    self.headers.insert(name, value);
                }
                ParseState::BodyContentLength { remaining } => {
                    if self.input.is_empty() {
                        return Ok(());
                    }
                    let take = std::cmp::min(remaining, self.input.len() as u64) as usize;
                    let data = self.input.split_to(take).freeze();
                    events.push(OriginEvent::Body(data));
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        events.push(OriginEvent::BodyComplete);
                        self.state = ParseState::Complete;
                    } else {
                        self.state = ParseState::BodyContentLength { remaining };
                    }
                }
                ParseState::BodyChunked => {
                    let complete = self.parse_chunked(events)?;
                    if complete {
                        events.push(OriginEvent::BodyComplete);
                        self.state = ParseState::Complete;
                    } else {
                        return Ok(());
                    }
                }
                ParseState::BodyToEof | ParseState::Tunnel => {
                    if self.input.is_empty() {
                        return Ok(());
                    }
                    let data = self.input.split_to(self.input.len()).freeze();
                    events.push(OriginEvent::Body(data));
                }
                ParseState::Complete => {
                    // Any pipelined bytes stay buffered; the bridge never
                    // issues a second request before re-pooling.
                    return Ok(());
                }
            }
        }
    }
}

impl Default for H1Origin {
    fn default() -> Self {
        Self::new()
    }
}

impl super::OriginConnection for H1Origin {
    fn attach(&mut self, stream_id: u32) -> Result<()> {
        if self.stream_id.is_some() {
            return Err(OriginError::Connect(
                "origin connection already attached".to_string(),
            ));
        }
        self.stream_id = Some(stream_id);
        Ok(())
    }

    fn detach(&mut self) {
        self.stream_id = None;
    }

    fn attached_stream(&self) -> Option<u32> {
        self.stream_id
    }

    fn push_request_headers(&mut self, request: &OriginRequest<'_>) -> Result<()> {
        if self.stream_id.is_none() {
            return Err(OriginError::NotAttached);
        }

        self.head_request = request.method.eq_ignore_ascii_case("HEAD");
        self.connect_request = request.method.eq_ignore_ascii_case("CONNECT");

        if self.connect_request {
            self.write_line(&format!("CONNECT {} HTTP/1.1", request.authority));
            self.write_line(&format!("host: {}", request.authority));
            self.write_line("");
            return Ok(());
        }

        self.write_line(&format!("{} {} HTTP/1.1", request.method, request.path));
        self.write_line(&format!("host: {}", request.authority));

        let upgrade = request
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("upgrade"))
            .map(|(_, v)| v.clone());

        for (name, value) in request.headers {
            if DROP_REQUEST_HEADERS
                .iter()
                .any(|d| name.eq_ignore_ascii_case(d))
            {
                continue;
            }
            self.write_line(&format!("{}: {}", name, value));
        }

        // A protocol upgrade request keeps its upgrade token and gets the
        // hop-scoped connection header rebuilt.
        if let Some(upgrade) = upgrade {
            self.write_line(&format!("upgrade: {}", upgrade));
            self.write_line("connection: upgrade");
        }

        self.write_line("");
        Ok(())
    }

    fn push_upload_data(&mut self, data: &[u8]) -> Result<()> {
        if self.stream_id.is_none() {
            return Err(OriginError::NotAttached);
        }
        // The request body is length-delimited; bytes pass through.
        self.output.extend_from_slice(data);
        Ok(())
    }

    fn end_upload_data(&mut self) -> Result<()> {
        if self.stream_id.is_none() {
            return Err(OriginError::NotAttached);
        }
        Ok(())
    }

    fn on_read(&mut self, input: &[u8]) -> Result<Vec<OriginEvent>> {
        if let Some(message) = self.poisoned.take() {
            return Err(OriginError::Parse(http::Error::Parse(message)));
        }

        self.input.extend_from_slice(input);
        let mut events = Vec::new();

        match self.parse_events(&mut events) {
            Ok(()) => Ok(events),
            Err(err) if events.is_empty() => Err(err),
            Err(err) => {
                // Deliver what parsed cleanly; the failure surfaces on the
                // next read so response headers are not lost.
                self.poisoned = Some(err.to_string());
                Ok(events)
            }
        }
    }

    fn pause_read(&mut self) {
        self.paused = true;
    }

    fn resume_read(&mut self) {
        self.paused = false;
    }

    fn wants_read(&self) -> bool {
        !self.paused
    }

    fn on_connected(&mut self) -> Result<()> {
        // The external loop owns the socket; record that TCP_NODELAY is
        // wanted so it can apply the option.
        self.nodelay = true;
        Ok(())
    }

    fn rst_error_code(&self) -> Option<ErrorCode> {
        // HTTP/1.1 origins have no stream-level cancellation.
        None
    }

    fn take_output(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    fn output_len(&self) -> usize {
        self.output.len()
    }
}
