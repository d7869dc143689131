//! Embedded HTTP/2 server codec
//!
//! A sans-IO HTTP/2 implementation: frame parsing and construction, HPACK
//! (via the `hpack` crate), settings, flow-control accounting, and the
//! event-driven [`session::H2Session`] that the bridge consumes.
//!
//! The session never touches a socket. Inbound bytes are handed to
//! [`session::H2Session::mem_recv`]; outbound spans are pulled with
//! [`session::H2Session::mem_send`]; everything the application must react
//! to arrives through [`session::H2Session::poll_event`].

pub mod codec;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod session;
pub mod settings;
pub mod stream;

pub use error::{Error, ErrorCode, Result};
pub use frames::{FrameFlags, FrameType};
pub use session::{H2Session, PullOutcome, ResponseSource, SessionEvent, SessionOptions};
pub use settings::{Settings, SettingsBuilder};
pub use stream::StreamId;

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;
