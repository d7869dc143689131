//! h2c upgrade path
//!
//! Bootstraps an HTTP/2 session from an HTTP/1.1 request that carried
//! `Upgrade: h2c` and an `HTTP2-Settings` header. The decoded settings
//! payload seeds the codec as if the client had sent it in a SETTINGS
//! frame, and the already-parsed request is adopted as stream 1.

use super::session::Http2Bridge;
use super::stream::{RequestState, Stream};
use super::{BridgeError, Result};
use crate::origin::OriginConnection;
use tracing::info;

/// An HTTP/1.1 request being promoted onto stream 1
pub struct UpgradeRequest {
    /// Request method
    pub method: String,
    /// Scheme the request arrived over
    pub scheme: String,
    /// Authority (from the request target or Host header)
    pub authority: String,
    /// Request path
    pub path: String,
    /// Request headers, including `http2-settings`
    pub headers: Vec<(String, String)>,
    /// Origin connection already carrying the request, if one was opened
    pub origin: Option<Box<dyn OriginConnection>>,
}

impl Http2Bridge {
    /// Adopt an upgraded HTTP/1.1 request as stream 1
    ///
    /// The `HTTP2-Settings` header value is base64url-decoded and handed
    /// to the codec; stream 1 is created with priority 0 and its request
    /// side marked complete. All subsequent behavior is the regular
    /// bridge path.
    pub fn upgrade_from_http1(&mut self, request: UpgradeRequest) -> Result<()> {
        let payload_b64 = request
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("http2-settings"))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| BridgeError::Upgrade("missing HTTP2-Settings header".to_string()))?;

        let payload = base64url_decode(&payload_b64)
            .ok_or_else(|| BridgeError::Upgrade("invalid HTTP2-Settings encoding".to_string()))?;

        self.codec
            .upgrade(&payload)
            .map_err(|e| BridgeError::Upgrade(e.to_string()))?;

        let mut stream = Stream::new(1, 0);
        stream.method = request.method;
        stream.scheme = request.scheme;
        stream.authority = request.authority;
        stream.path = request.path;
        for (name, value) in &request.headers {
            stream.append_request_header(&name.to_ascii_lowercase(), value);
        }
        // The HTTP/1.1 side finished reading the request before switching
        // protocols.
        stream.request_state = RequestState::MsgComplete;

        if let Some(mut origin) = request.origin {
            origin.detach();
            origin
                .attach(1)
                .map_err(|e| BridgeError::Upgrade(e.to_string()))?;
            stream.origin = Some(origin);
        }

        self.core.streams.insert(stream);
        info!("h2c upgrade complete; request adopted on stream 1");
        Ok(())
    }
}

const BASE64_PAD: u8 = b'=';

/// Decode base64url (or standard base64), padding optional
fn base64url_decode(input: &str) -> Option<Vec<u8>> {
    fn value(b: u8) -> Option<u32> {
        match b {
            b'A'..=b'Z' => Some((b - b'A') as u32),
            b'a'..=b'z' => Some((b - b'a' + 26) as u32),
            b'0'..=b'9' => Some((b - b'0' + 52) as u32),
            b'+' | b'-' => Some(62),
            b'/' | b'_' => Some(63),
            _ => None,
        }
    }

    let trimmed: &[u8] = input.as_bytes();
    let trimmed = match trimmed.iter().position(|&b| b == BASE64_PAD) {
        Some(i) => &trimmed[..i],
        None => trimmed,
    };
    if trimmed.len() % 4 == 1 {
        return None;
    }

    let mut out = Vec::with_capacity(trimmed.len() * 3 / 4);
    for chunk in trimmed.chunks(4) {
        let mut acc = 0u32;
        for &b in chunk {
            acc = (acc << 6) | value(b)?;
        }
        acc <<= 6 * (4 - chunk.len()) as u32;
        let bytes = acc.to_be_bytes();
        // 4 input chars produce 3 bytes; shorter tails produce fewer.
        out.extend_from_slice(&bytes[1..chunk.len()]);
    }
    Some(out)
}
