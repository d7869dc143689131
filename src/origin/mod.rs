//! Origin (downstream) connections
//!
//! The bridge relays each HTTP/2 stream to one origin connection. The
//! connection is a detachable resource: a stream holds it while the request
//! is in flight, and at stream close it is either handed back to the client
//! handler for pooling or dropped.
//!
//! [`OriginConnection`] is the interface the bridge consumes;
//! [`http1::H1Origin`] is the HTTP/1.1 implementation.

pub mod http1;

pub use http1::H1Origin;

use crate::h2::ErrorCode;
use crate::http::{Headers, Status, Version};
use bytes::Bytes;

/// Result type for origin operations
pub type Result<T> = std::result::Result<T, OriginError>;

/// Origin connection errors
#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("origin write failed: {0}")]
    Write(String),

    #[error("origin response parse failed: {0}")]
    Parse(#[from] crate::http::Error),

    #[error("origin connection not attached")]
    NotAttached,
}

/// Transport-level events reported by the external loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginIoEvent {
    /// The transport finished connecting
    Connected,
    /// The origin closed its side
    Eof,
    /// The transport failed
    Error,
    /// An origin I/O timeout fired
    Timeout,
}

/// Parser events produced while reading an origin response
#[derive(Debug)]
pub enum OriginEvent {
    /// The response status line and headers are complete
    HeadersComplete(ResponseHead),
    /// A decoded chunk of response body
    Body(Bytes),
    /// The response body is complete (the connection may be reusable)
    BodyComplete,
    /// The origin cancelled the exchange with the given stream error code
    Cancelled(ErrorCode),
}

/// Parsed origin response head
#[derive(Debug)]
pub struct ResponseHead {
    /// Response status
    pub status: Status,
    /// Origin HTTP version (carried into the `via` token)
    pub version: Version,
    /// Response headers as received
    pub headers: Headers,
    /// The origin demanded connection close
    pub connection_close: bool,
    /// The exchange switched to an opaque tunnel (101, or 2xx to CONNECT)
    pub tunnel: bool,
}

/// The request side of a relayed stream, as handed to the origin
#[derive(Debug)]
pub struct OriginRequest<'a> {
    /// Request method (any token; CONNECT selects tunnel serialization)
    pub method: &'a str,
    /// `:authority`, or the `host` header when absent
    pub authority: &'a str,
    /// Request path (empty for CONNECT)
    pub path: &'a str,
    /// Regular request headers, already normalized to lowercase
    pub headers: &'a [(String, String)],
}

/// One origin connection, attached to at most one stream
///
/// All methods are sans-IO: serialized request bytes accumulate in an
/// output buffer the external loop drains with
/// [`OriginConnection::take_output`], and inbound bytes arrive through the
/// bridge's relay entry points.
pub trait OriginConnection {
    /// Bind this connection to a stream
    fn attach(&mut self, stream_id: u32) -> Result<()>;

    /// Release the connection from its stream
    fn detach(&mut self);

    /// Stream id this connection serves, if attached
    fn attached_stream(&self) -> Option<u32>;

    /// Serialize and queue the request head
    fn push_request_headers(&mut self, request: &OriginRequest<'_>) -> Result<()>;

    /// Queue a chunk of request body
    fn push_upload_data(&mut self, data: &[u8]) -> Result<()>;

    /// Signal the end of the request body
    fn end_upload_data(&mut self) -> Result<()>;

    /// Parse inbound origin bytes into events
    fn on_read(&mut self, input: &[u8]) -> Result<Vec<OriginEvent>>;

    /// Stop requesting origin socket reads (backpressure)
    fn pause_read(&mut self);

    /// Resume origin socket reads
    fn resume_read(&mut self);

    /// Whether the external loop should read from the origin socket
    fn wants_read(&self) -> bool;

    /// The transport finished connecting; set transport options
    fn on_connected(&mut self) -> Result<()>;

    /// Error code from an origin-side cancellation, if any
    fn rst_error_code(&self) -> Option<ErrorCode>;

    /// Drain queued outbound request bytes
    fn take_output(&mut self) -> Bytes;

    /// Bytes still queued for the origin
    fn output_len(&self) -> usize;
}
