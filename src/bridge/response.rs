//! Response submission toward the client
//!
//! Origin response heads are normalized, filtered and re-submitted as
//! HTTP/2 responses; origin bodies stream through the per-stream response
//! buffer; and synthesized error replies cover origin failures that happen
//! before any response headers were produced.

use super::session::Http2Bridge;
use super::stream::ResponseState;
use super::{BridgeConfig, Result, OUTBUF_MAX_THRES};
use crate::h2::ErrorCode;
use crate::http::{Status, Version};
use crate::origin::ResponseHead;
use tracing::{debug, warn};

/// Response headers never forwarded to an HTTP/2 client
///
/// Connection-specific headers have no meaning on a multiplexed session;
/// `via` is reassembled separately.
const DROP_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "via",
];

/// Map an origin-reported stream error onto the code shown to the client
///
/// Only REFUSED_STREAM is preserved, so clients know the request was not
/// processed and may safely retry; every other origin code becomes
/// INTERNAL_ERROR.
pub fn infer_origin_rst_code(origin_code: ErrorCode) -> ErrorCode {
    if origin_code == ErrorCode::RefusedStream {
        ErrorCode::RefusedStream
    } else {
        ErrorCode::InternalError
    }
}

/// HTML body for a synthesized error reply
pub fn create_error_html(status: Status, server_name: &str) -> String {
    format!(
        "<html><head><title>{status}</title></head>\
         <body><h1>{status}</h1><hr><address>{server} at port</address></body></html>\n",
        status = status,
        server = server_name,
    )
}

/// Build the `via` value for a relayed response
///
/// The bridge's token (`1.1 name` for an HTTP/1.1 origin) is appended to
/// any value the origin already carried.
pub fn build_via_value(existing: Option<&str>, version: Version, server_name: &str) -> String {
    let (major, minor) = version.parts();
    let token = format!("{}.{} {}", major, minor, server_name);
    match existing {
        Some(value) if !value.is_empty() => format!("{}, {}", value, token),
        _ => token,
    }
}

/// Rewrite a Location header to the client-facing scheme and port
///
/// Only absolute URLs whose host matches the request authority are
/// rewritten; everything else passes through untouched.
pub fn rewrite_location(
    location: &str,
    request_authority: &str,
    client_scheme: &str,
    port: u16,
) -> String {
    let Some((_, rest)) = location.split_once("://") else {
        return location.to_string();
    };
    let (hostport, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    if hostport.is_empty() {
        return location.to_string();
    }

    let host = hostport.split(':').next().unwrap_or(hostport);
    let authority_host = request_authority
        .split(':')
        .next()
        .unwrap_or(request_authority);
    if host.is_empty() || !host.eq_ignore_ascii_case(authority_host) {
        return location.to_string();
    }

    let default_port = match client_scheme {
        "https" => 443,
        _ => 80,
    };
    if port == default_port {
        format!("{}://{}{}", client_scheme, host, path)
    } else {
        format!("{}://{}:{}{}", client_scheme, host, port, path)
    }
}

/// Build the HTTP/2 response header list from an origin response head
///
/// `[:status, …filtered origin headers, via]`. The collection already
/// carries lowercase names; duplicates are concatenated per HTTP/2 rules
/// (never `set-cookie`) and the Location rewrite applies outside proxy
/// mode.
pub fn assemble_response_headers(
    head: &ResponseHead,
    config: &BridgeConfig,
    client_scheme: &str,
    request_authority: &str,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::with_capacity(head.headers.len() + 2);
    out.push((":status".to_string(), head.status.code().to_string()));

    for (name, value) in head.headers.iter() {
        if DROP_RESPONSE_HEADERS.iter().any(|d| *d == name) {
            continue;
        }

        let value = if name == "location" && !config.http2_proxy {
            rewrite_location(value, request_authority, client_scheme, config.port)
        } else {
            value.to_string()
        };

        // Repeated fields are concatenated; set-cookie stays one field
        // per value.
        if name != "set-cookie" {
            if let Some(existing) = out.iter_mut().find(|(n, _)| n.as_str() == name) {
                existing.1.push_str(", ");
                existing.1.push_str(&value);
                continue;
            }
        }
        out.push((name.to_string(), value));
    }

    let origin_via = head.headers.get("via");
    if config.no_via {
        if let Some(via) = origin_via {
            out.push(("via".to_string(), via.to_string()));
        }
    } else {
        out.push((
            "via".to_string(),
            build_via_value(origin_via, head.version, &config.server_name),
        ));
    }

    out
}

impl Http2Bridge {
    /// The origin response head is complete; submit the HTTP/2 response
    ///
    /// Submission failure is fatal to the session.
    pub(super) fn on_origin_header_complete(
        &mut self,
        stream_id: u32,
        head: ResponseHead,
    ) -> Result<()> {
        let client_scheme = self.handler.client_scheme().to_string();

        let Some(stream) = self.core.streams.find_mut(stream_id) else {
            return Ok(());
        };
        debug!(stream_id, status = head.status.code(), "origin response header complete");

        stream.response_connection_close = head.connection_close;
        if head.tunnel {
            stream.upgraded = true;
        }
        stream.response_state = ResponseState::HeaderComplete;

        let headers = assemble_response_headers(
            &head,
            &self.core.config,
            &client_scheme,
            &stream.request_authority().to_string(),
        );

        self.codec.submit_response(stream_id, &headers)?;
        Ok(())
    }

    /// Append origin body bytes to the stream's response buffer
    ///
    /// The codec's data source is resumed after every append; the origin is
    /// paused once the buffered bytes exceed the backpressure threshold.
    pub(super) fn on_origin_body(&mut self, stream_id: u32, data: &[u8]) -> Result<()> {
        let outbuf_len = self.handler.output_len();
        let Some(stream) = self.core.streams.find_mut(stream_id) else {
            return Ok(());
        };
        if !matches!(
            stream.response_state,
            ResponseState::HeaderComplete | ResponseState::MsgComplete
        ) {
            // No response in flight for these bytes.
            return Ok(());
        }

        stream.response_body.extend_from_slice(data);
        let buffered = stream.response_body.len();
        if outbuf_len + buffered > OUTBUF_MAX_THRES {
            if let Some(origin) = stream.origin.as_mut() {
                origin.pause_read();
            }
        }
        self.codec.resume_data(stream_id);
        Ok(())
    }

    /// The origin finished the response body
    ///
    /// Only resumes the data source; it observes MSG_COMPLETE and closes
    /// (or resets, for tunnels) the stream.
    pub(super) fn on_origin_body_complete(&mut self, stream_id: u32) {
        if let Some(stream) = self.core.streams.find_mut(stream_id) {
            debug!(stream_id, "origin response complete");
            stream.response_state = ResponseState::MsgComplete;
        }
        self.codec.resume_data(stream_id);
    }

    /// Synthesize an HTML error reply on a stream
    ///
    /// Used whenever the origin fails before response headers were
    /// produced. Submission failure is fatal to the session.
    pub fn error_reply(&mut self, stream_id: u32, status: Status) -> Result<()> {
        let html = create_error_html(status, &self.core.config.server_name);
        let server_name = self.core.config.server_name.clone();

        let Some(stream) = self.core.streams.find_mut(stream_id) else {
            return Ok(());
        };
        warn!(stream_id, status = status.code(), "synthesizing error reply");

        stream.response_body.clear();
        stream.response_body.extend_from_slice(html.as_bytes());
        stream.response_state = ResponseState::MsgComplete;

        let headers = vec![
            (":status".to_string(), status.code().to_string()),
            (
                "content-type".to_string(),
                "text/html; charset=UTF-8".to_string(),
            ),
            ("server".to_string(), server_name),
            ("content-length".to_string(), html.len().to_string()),
        ];
        self.codec.submit_response(stream_id, &headers)?;
        Ok(())
    }
}
