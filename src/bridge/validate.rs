//! Request validation
//!
//! Pseudo-header and header set checks run when a request header block
//! completes, before any origin connection is opened. Violations reset the
//! stream with PROTOCOL_ERROR; they are never fatal to the session.

use std::fmt;

/// Why a request was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Duplicate pseudo-header, pseudo-header after a regular header, or
    /// an unknown pseudo-header
    MalformedHeaderBlock,
    /// CONNECT carried `:scheme` or `:path`, or lacked `:authority`
    BadConnect,
    /// `:method`, `:scheme` or `:path` absent or empty
    MissingPseudo,
    /// Neither `:authority` nor `host` identifies the target
    MissingAuthority,
    /// A request body is coming but `content-length` is absent or blank
    MissingContentLength,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ValidationError::MalformedHeaderBlock => "malformed header block",
            ValidationError::BadConnect => "invalid CONNECT pseudo-headers",
            ValidationError::MissingPseudo => "missing required pseudo-header",
            ValidationError::MissingAuthority => "no authority or host",
            ValidationError::MissingContentLength => "request body without content-length",
        };
        f.write_str(msg)
    }
}

/// Cached pseudo-fields of an accepted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParts {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
}

/// Header field check applied as fields are ingested
///
/// Invalid fields are dropped, never fatal: names must be lowercase HTTP/2
/// field names (or one of the request pseudo-headers) and values must be
/// free of line breaks. NUL is allowed in values as the repeated-field
/// join byte.
pub fn check_nv(name: &[u8], value: &[u8]) -> bool {
    if name.is_empty() {
        return false;
    }

    let token = if name[0] == b':' { &name[1..] } else { &name[..] };
    if token.is_empty() {
        return false;
    }
    for &b in token {
        let ok = b.is_ascii_lowercase()
            || b.is_ascii_digit()
            || matches!(
                b,
                b'!' | b'#'
                    | b'$'
                    | b'%'
                    | b'&'
                    | b'\''
                    | b'*'
                    | b'+'
                    | b'-'
                    | b'.'
                    | b'^'
                    | b'_'
                    | b'`'
                    | b'|'
                    | b'~'
            );
        if !ok {
            return false;
        }
    }

    !value.iter().any(|&b| b == b'\r' || b == b'\n')
}

/// Whether a value is linear whitespace only (or empty)
pub fn value_lws(value: &str) -> bool {
    value.chars().all(|c| c == ' ' || c == '\t')
}

const REQUEST_PSEUDO_HEADERS: &[&str] = &[":method", ":scheme", ":authority", ":path"];

/// Value of a header occurring exactly once, `None` when absent,
/// `Err(())` when duplicated
fn unique<'a>(headers: &'a [(String, String)], name: &str) -> std::result::Result<Option<&'a str>, ()> {
    let mut found = None;
    for (n, v) in headers {
        if n == name {
            if found.is_some() {
                return Err(());
            }
            found = Some(v.as_str());
        }
    }
    Ok(found)
}

fn non_empty(value: Option<&str>) -> bool {
    value.map(|v| !v.is_empty()).unwrap_or(false)
}

/// General HTTP/2 header block conformance
///
/// Pseudo-headers must be from the request set and must precede every
/// regular header.
fn check_header_block(headers: &[(String, String)]) -> bool {
    let mut seen_regular = false;
    for (name, _) in headers {
        if name.starts_with(':') {
            if seen_regular || !REQUEST_PSEUDO_HEADERS.contains(&name.as_str()) {
                return false;
            }
        } else {
            seen_regular = true;
        }
    }
    true
}

/// Validate a complete request header block
///
/// `end_stream` is true when the HEADERS frame closed the request side (no
/// body follows). `http2_proxy` makes `:authority` mandatory for
/// non-CONNECT requests.
pub fn validate_request(
    headers: &[(String, String)],
    end_stream: bool,
    http2_proxy: bool,
) -> std::result::Result<RequestParts, ValidationError> {
    if !check_header_block(headers) {
        return Err(ValidationError::MalformedHeaderBlock);
    }

    let method = unique(headers, ":method").map_err(|_| ValidationError::MalformedHeaderBlock)?;
    let scheme = unique(headers, ":scheme").map_err(|_| ValidationError::MalformedHeaderBlock)?;
    let authority =
        unique(headers, ":authority").map_err(|_| ValidationError::MalformedHeaderBlock)?;
    let path = unique(headers, ":path").map_err(|_| ValidationError::MalformedHeaderBlock)?;
    let host = unique(headers, "host").map_err(|_| ValidationError::MalformedHeaderBlock)?;

    let is_connect = method == Some("CONNECT");
    let having_authority = non_empty(authority);
    let having_host = non_empty(host);

    if is_connect {
        // CONNECT strictly requires :authority and nothing else.
        if scheme.is_some() || path.is_some() || !having_authority {
            return Err(ValidationError::BadConnect);
        }
    } else {
        if !non_empty(method) || !non_empty(scheme) || !non_empty(path) {
            return Err(ValidationError::MissingPseudo);
        }
        if http2_proxy && !having_authority {
            return Err(ValidationError::MissingAuthority);
        }
        if !http2_proxy && !having_authority && !having_host {
            return Err(ValidationError::MissingAuthority);
        }
    }

    if !is_connect && !end_stream {
        // A body follows; the origin relay only writes length-delimited
        // uploads, so content-length is mandatory and must not be blank.
        let content_length = headers
            .iter()
            .find(|(n, _)| n == "content-length")
            .map(|(_, v)| v.as_str());
        match content_length {
            None => return Err(ValidationError::MissingContentLength),
            Some(v) if value_lws(v) => return Err(ValidationError::MissingContentLength),
            Some(_) => {}
        }
    }

    Ok(RequestParts {
        method: method.unwrap_or_default().to_string(),
        scheme: scheme.unwrap_or_default().to_string(),
        authority: authority.unwrap_or_default().to_string(),
        path: path.unwrap_or_default().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(fields: &[(&str, &str)]) -> Vec<(String, String)> {
        fields
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_check_nv() {
        assert!(check_nv(b":method", b"GET"));
        assert!(check_nv(b"content-length", b"12"));
        assert!(check_nv(b"cookie", b"a=1\0b=2"));
        assert!(!check_nv(b"Content-Length", b"12"));
        assert!(!check_nv(b"bad header", b"x"));
        assert!(!check_nv(b"", b"x"));
        assert!(!check_nv(b":", b"x"));
        assert!(!check_nv(b"x-injected", b"a\r\nevil: 1"));
    }

    #[test]
    fn test_value_lws() {
        assert!(value_lws(""));
        assert!(value_lws("  \t"));
        assert!(!value_lws(" 5"));
    }

    #[test]
    fn test_valid_get() {
        let parts = validate_request(
            &h(&[
                (":method", "GET"),
                (":scheme", "https"),
                (":authority", "a.example"),
                (":path", "/x"),
            ]),
            true,
            false,
        )
        .unwrap();
        assert_eq!(parts.method, "GET");
        assert_eq!(parts.authority, "a.example");
        assert_eq!(parts.path, "/x");
    }

    #[test]
    fn test_host_can_substitute_authority() {
        assert!(validate_request(
            &h(&[
                (":method", "GET"),
                (":scheme", "https"),
                (":path", "/"),
                ("host", "a.example"),
            ]),
            true,
            false,
        )
        .is_ok());

        // But not in proxy mode.
        assert_eq!(
            validate_request(
                &h(&[
                    (":method", "GET"),
                    (":scheme", "https"),
                    (":path", "/"),
                    ("host", "a.example"),
                ]),
                true,
                true,
            ),
            Err(ValidationError::MissingAuthority)
        );
    }

    #[test]
    fn test_connect_rules() {
        assert!(validate_request(
            &h(&[(":method", "CONNECT"), (":authority", "a.example:443")]),
            false,
            false,
        )
        .is_ok());

        // scheme present with CONNECT
        assert_eq!(
            validate_request(
                &h(&[
                    (":method", "CONNECT"),
                    (":scheme", "https"),
                    (":authority", "a.example:443"),
                ]),
                false,
                false,
            ),
            Err(ValidationError::BadConnect)
        );

        // no authority
        assert_eq!(
            validate_request(&h(&[(":method", "CONNECT")]), false, false),
            Err(ValidationError::BadConnect)
        );
    }

    #[test]
    fn test_missing_path() {
        assert_eq!(
            validate_request(
                &h(&[
                    (":method", "GET"),
                    (":scheme", "https"),
                    (":authority", "a.example"),
                ]),
                true,
                false,
            ),
            Err(ValidationError::MissingPseudo)
        );
    }

    #[test]
    fn test_body_requires_content_length() {
        let fields = [
            (":method", "POST"),
            (":scheme", "https"),
            (":authority", "a.example"),
            (":path", "/upload"),
        ];

        assert_eq!(
            validate_request(&h(&fields), false, false),
            Err(ValidationError::MissingContentLength)
        );

        // Blank content-length is as bad as a missing one.
        let mut with_blank = h(&fields);
        with_blank.push(("content-length".to_string(), "  ".to_string()));
        assert_eq!(
            validate_request(&with_blank, false, false),
            Err(ValidationError::MissingContentLength)
        );

        let mut with_length = h(&fields);
        with_length.push(("content-length".to_string(), "5".to_string()));
        assert!(validate_request(&with_length, false, false).is_ok());

        // No body, no content-length needed.
        assert!(validate_request(&h(&fields), true, false).is_ok());
    }

    #[test]
    fn test_duplicate_pseudo_rejected() {
        assert_eq!(
            validate_request(
                &h(&[
                    (":method", "GET"),
                    (":method", "POST"),
                    (":scheme", "https"),
                    (":authority", "a.example"),
                    (":path", "/"),
                ]),
                true,
                false,
            ),
            Err(ValidationError::MalformedHeaderBlock)
        );
    }

    #[test]
    fn test_pseudo_after_regular_rejected() {
        assert_eq!(
            validate_request(
                &h(&[
                    (":method", "GET"),
                    ("accept", "*/*"),
                    (":scheme", "https"),
                    (":authority", "a.example"),
                    (":path", "/"),
                ]),
                true,
                false,
            ),
            Err(ValidationError::MalformedHeaderBlock)
        );
    }

    #[test]
    fn test_unknown_pseudo_rejected() {
        assert_eq!(
            validate_request(
                &h(&[
                    (":method", "GET"),
                    (":scheme", "https"),
                    (":authority", "a.example"),
                    (":path", "/"),
                    (":nonsense", "x"),
                ]),
                true,
                false,
            ),
            Err(ValidationError::MalformedHeaderBlock)
        );
    }
}
