//! Per-stream request/response state
//!
//! One [`Stream`] per HTTP/2 stream id, holding both half-states of the
//! relayed exchange, the normalized request header list, the response body
//! buffer feeding the codec's data source, and the detachable origin
//! connection handle.

use crate::h2::ErrorCode;
use crate::origin::OriginConnection;
use bytes::BytesMut;
use std::collections::HashMap;

/// Request-side state of a relayed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Stream allocated, headers still arriving
    Initial,
    /// Request headers validated and pushed to the origin
    HeaderComplete,
    /// The request, body included, is fully received
    MsgComplete,
    /// The codec reported stream closure
    StreamClosed,
    /// Origin connect failed while handling the request headers
    ConnectFail,
}

/// Response-side state of a relayed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// Nothing received from the origin yet
    Initial,
    /// Response headers submitted toward the client
    HeaderComplete,
    /// The response is complete (origin finished or error synthesized)
    MsgComplete,
    /// The origin cancelled the exchange
    MsgReset,
}

/// One relayed HTTP/2 stream
pub struct Stream {
    stream_id: u32,
    priority: u32,
    pub request_state: RequestState,
    pub response_state: ResponseState,

    /// Request headers in arrival order, pseudo-headers included,
    /// normalized to lowercase and split on NUL
    pub request_headers: Vec<(String, String)>,
    /// Running total of raw header bytes appended
    pub request_headers_sum: usize,

    // cached request pseudo-fields
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,

    /// The exchange became an opaque tunnel (CONNECT or accepted upgrade)
    pub upgraded: bool,
    /// Response body bytes awaiting the codec's data source
    pub response_body: BytesMut,
    /// Detachable origin connection; the pool owns it after stream close
    pub origin: Option<Box<dyn OriginConnection>>,
    /// Error code the origin cancelled with
    pub response_rst_error_code: Option<ErrorCode>,
    /// The origin demanded connection close; never pooled
    pub response_connection_close: bool,
}

impl Stream {
    /// Allocate a stream and initialize its response body buffer
    pub fn new(stream_id: u32, priority: u32) -> Self {
        Stream {
            stream_id,
            priority,
            request_state: RequestState::Initial,
            response_state: ResponseState::Initial,
            request_headers: Vec::new(),
            request_headers_sum: 0,
            method: String::new(),
            scheme: String::new(),
            authority: String::new(),
            path: String::new(),
            upgraded: false,
            response_body: BytesMut::new(),
            origin: None,
            response_rst_error_code: None,
            response_connection_close: false,
        }
    }

    /// Stream id
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Peer-advertised priority
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Store a re-prioritization from the peer
    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    /// Append one request header field
    ///
    /// The raw name and value lengths are accounted toward the header size
    /// budget; values are split on NUL, the join convention for repeated
    /// fields in a header block.
    pub fn append_request_header(&mut self, name: &str, value: &str) {
        self.request_headers_sum += name.len() + value.len();
        for part in value.split('\0') {
            self.request_headers
                .push((name.to_string(), part.to_string()));
        }
    }

    /// The authority the origin request is addressed to
    ///
    /// `:authority` when present, else the `host` header.
    pub fn request_authority(&self) -> &str {
        if !self.authority.is_empty() {
            return &self.authority;
        }
        self.request_headers
            .iter()
            .find(|(n, _)| n == "host")
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    /// Regular (non-pseudo) request headers
    pub fn regular_request_headers(&self) -> Vec<(String, String)> {
        self.request_headers
            .iter()
            .filter(|(n, _)| !n.starts_with(':'))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("stream_id", &self.stream_id)
            .field("request_state", &self.request_state)
            .field("response_state", &self.response_state)
            .field("upgraded", &self.upgraded)
            .field("origin", &self.origin.is_some())
            .finish()
    }
}

/// Stream table for one bridge session
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: HashMap<u32, Stream>,
}

impl StreamTable {
    /// Create an empty table
    pub fn new() -> Self {
        StreamTable {
            streams: HashMap::new(),
        }
    }

    /// Insert a stream, replacing any stale entry with the same id
    pub fn insert(&mut self, stream: Stream) {
        self.streams.insert(stream.stream_id(), stream);
    }

    /// Look up a stream
    pub fn find(&self, stream_id: u32) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    /// Look up a stream mutably
    pub fn find_mut(&mut self, stream_id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Remove a stream; idempotent
    pub fn remove(&mut self, stream_id: u32) -> Option<Stream> {
        self.streams.remove(&stream_id)
    }

    /// Number of live streams
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
