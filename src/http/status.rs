//! Status codes and protocol versions
//!
//! [`Status`] backs both sides of the relay: parsed origin status lines on
//! the way in, `:status` and synthesized error replies on the way out.
//! [`Version`] only ever names an HTTP/1.x origin protocol; its numeric
//! parts feed the `via` token the bridge appends.

use super::{Error, Result};
use std::fmt;

/// Protocol version of an HTTP/1.x origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    /// Parse the version token of a status line
    ///
    /// Anything outside HTTP/1.x is rejected; an origin speaking another
    /// major version cannot be relayed by this path.
    pub fn from_str(token: &str) -> Result<Self> {
        match token.strip_prefix("HTTP/1.") {
            Some("0") => Ok(Version::Http10),
            Some("1") => Ok(Version::Http11),
            _ => Err(Error::InvalidVersion(token.to_string())),
        }
    }

    /// Major and minor version numbers, for `via` tokens
    pub fn parts(&self) -> (u8, u8) {
        let minor = match self {
            Version::Http10 => 0,
            Version::Http11 => 1,
        };
        (1, minor)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor) = self.parts();
        write!(f, "HTTP/{major}.{minor}")
    }
}

/// Reason phrases for the statuses this crate expects to relay or emit
///
/// Anything not listed renders as "Unknown"; the code itself is always
/// what goes on the wire.
const REASON_PHRASES: &[(u16, &str)] = &[
    (100, "Continue"),
    (101, "Switching Protocols"),
    (200, "OK"),
    (201, "Created"),
    (202, "Accepted"),
    (204, "No Content"),
    (206, "Partial Content"),
    (301, "Moved Permanently"),
    (302, "Found"),
    (303, "See Other"),
    (304, "Not Modified"),
    (307, "Temporary Redirect"),
    (308, "Permanent Redirect"),
    (400, "Bad Request"),
    (401, "Unauthorized"),
    (403, "Forbidden"),
    (404, "Not Found"),
    (405, "Method Not Allowed"),
    (408, "Request Timeout"),
    (411, "Length Required"),
    (413, "Payload Too Large"),
    (500, "Internal Server Error"),
    (501, "Not Implemented"),
    (502, "Bad Gateway"),
    (503, "Service Unavailable"),
    (504, "Gateway Timeout"),
    (505, "HTTP Version Not Supported"),
];

/// A validated HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Validate a numeric code into a status
    ///
    /// Only the registered classes 1xx through 5xx are accepted.
    pub fn new(code: u16) -> Result<Self> {
        if !(100..600).contains(&code) {
            return Err(Error::InvalidStatus(code.to_string()));
        }
        Ok(Status { code })
    }

    /// The numeric code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Canonical reason phrase, or "Unknown" for unlisted codes
    pub fn reason_phrase(&self) -> &'static str {
        REASON_PHRASES
            .iter()
            .find(|(code, _)| *code == self.code)
            .map_or("Unknown", |(_, phrase)| phrase)
    }

    /// Whether this is an interim 1xx status
    pub fn is_informational(&self) -> bool {
        self.code / 100 == 1
    }

    /// Whether this is a 2xx status
    pub fn is_success(&self) -> bool {
        self.code / 100 == 2
    }

    /// Whether a response with this status never carries a body
    pub fn is_bodyless(&self) -> bool {
        self.is_informational() || self.code == 204 || self.code == 304
    }

    // Statuses synthesized by the bridge

    pub const BAD_GATEWAY: Status = Status { code: 502 };
    pub const GATEWAY_TIMEOUT: Status = Status { code: 504 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{code} {reason}", code = self.code, reason = self.reason_phrase())
    }
}
