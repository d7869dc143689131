//! HTTP/2 upstream bridge
//!
//! Terminates an HTTP/2 session from a client ("upstream" side) and relays
//! each stream to a per-request HTTP/1.x origin connection ("downstream"
//! side). The bridge is driven entirely by the external event loop through
//! [`Http2Bridge::on_read`], [`Http2Bridge::on_write`], the origin relay
//! entry points, and the timer poll.

pub mod config;
pub mod relay;
pub mod response;
pub mod session;
pub mod stream;
pub mod upgrade;
pub mod validate;

pub use config::{BridgeConfig, BridgeConfigBuilder};
pub use session::Http2Bridge;
pub use stream::{RequestState, ResponseState, Stream, StreamTable};
pub use upgrade::UpgradeRequest;

use crate::origin::OriginConnection;
use std::time::Duration;

/// Backpressure threshold for the client output path (64 KiB)
///
/// Gates both the send loop (stop draining the codec) and origin-read
/// resumption (pause the origin while over, resume when under).
pub const OUTBUF_MAX_THRES: usize = 64 * 1024;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Session-fatal bridge errors
///
/// Everything here tears down the client connection; per-stream failures
/// are handled internally with RST_STREAM or synthesized error replies and
/// never surface through this type.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("HTTP/2 codec error: {0}")]
    Codec(#[from] crate::h2::Error),

    #[error("client output buffer failure: {0}")]
    Output(#[source] std::io::Error),

    #[error("h2c upgrade failed: {0}")]
    Upgrade(String),

    #[error("session finished")]
    SessionEnd,
}

/// The owning client connection, as seen by the bridge
///
/// One per client socket. The bridge appends serialized HTTP/2 output to
/// the handler's buffer, asks it for fresh origin connections, and hands
/// reusable origin connections back for pooling.
pub trait ClientHandler {
    /// Append outbound bytes to the client socket buffer
    fn append_output(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Bytes currently queued toward the client
    fn output_len(&self) -> usize;

    /// Open (or check out) an origin connection for one request
    fn connect_origin(&mut self) -> crate::origin::Result<Box<dyn OriginConnection>>;

    /// Take back a reusable origin connection
    fn pool_origin(&mut self, conn: Box<dyn OriginConnection>);

    /// Configure client-side read/write timeouts for this protocol
    fn set_upstream_timeouts(&mut self, read: Duration, write: Duration);

    /// Scheme the client connected with ("https" or "http")
    fn client_scheme(&self) -> &str;
}
