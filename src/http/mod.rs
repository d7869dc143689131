//! Shared HTTP plumbing
//!
//! Types used on both sides of the bridge: the ordered, case-insensitive
//! header collection, status codes with canonical reason phrases, and the
//! HTTP version token carried into `via` headers.

pub mod headers;
pub mod status;

pub use headers::Headers;
pub use status::{Status, Version};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 128;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
