//! Client side of the HTTP/1.1 upgrade handshake (RFC 6455 Section 4).

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::request::{Endpoint, Request};

/// The WebSocket GUID used in the Sec-WebSocket-Accept calculation (RFC 6455).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Headers the engine writes itself; callers may not supply them.
const MANAGED_HEADERS: [&str; 6] = [
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
];

/// Computes the Sec-WebSocket-Accept value from a Sec-WebSocket-Key.
///
/// The accept key is calculated as: Base64(SHA-1(key + GUID))
///
/// # Example
///
/// ```
/// use rsws_engine::protocol::handshake::compute_accept_key;
///
/// let key = "dGhlIHNhbXBsZSBub25jZQ==";
/// let accept = compute_accept_key(key);
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Base64 encoding of 16 bytes from the system RNG.
///
/// # Errors
///
/// Returns [`Error::Io`] if the system RNG is unavailable.
pub fn generate_key() -> Result<String> {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce).map_err(|e| Error::Io(format!("rng unavailable: {e}")))?;
    Ok(BASE64.encode(nonce))
}

/// Position just past the `\r\n\r\n` that ends an HTTP header block.
#[must_use]
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn validate_header(name: &str, value: &str) -> Result<()> {
    let name_ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b':');
    if !name_ok {
        return Err(Error::InvalidHeaderValue {
            header: name.to_string(),
            reason: "not a valid header name".into(),
        });
    }
    if value.contains(['\r', '\n']) {
        return Err(Error::InvalidHeaderValue {
            header: name.to_string(),
            reason: "contains CR or LF characters".into(),
        });
    }
    Ok(())
}

/// The upgrade request sent once the transport is connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    key: String,
    protocols: Vec<String>,
    bytes: Vec<u8>,
}

impl HandshakeRequest {
    /// Build the request with a freshly generated key.
    ///
    /// `extension_offer` is the `Sec-WebSocket-Extensions` value to send, if any.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidHeaderValue` for header names or values that would break
    ///   the request, or caller headers the engine manages itself
    /// - `Error::Io` if no key could be generated
    pub fn new(
        request: &Request,
        endpoint: &Endpoint,
        extension_offer: Option<&str>,
    ) -> Result<Self> {
        Self::with_key(request, endpoint, extension_offer, generate_key()?)
    }

    /// Build the request with a caller-chosen key.
    ///
    /// # Errors
    ///
    /// Same as [`HandshakeRequest::new`].
    pub fn with_key(
        request: &Request,
        endpoint: &Endpoint,
        extension_offer: Option<&str>,
        key: String,
    ) -> Result<Self> {
        let mut lines: Vec<(String, String)> = Vec::new();

        let custom_host = request
            .headers()
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("host"))
            .map(|(_, value)| value.clone());
        lines.push((
            "Host".into(),
            custom_host.unwrap_or_else(|| endpoint.host_header.clone()),
        ));
        lines.push(("Upgrade".into(), "websocket".into()));
        lines.push(("Connection".into(), "Upgrade".into()));
        lines.push(("Sec-WebSocket-Key".into(), key.clone()));
        lines.push(("Sec-WebSocket-Version".into(), "13".into()));

        if !request.protocols().is_empty() {
            lines.push((
                "Sec-WebSocket-Protocol".into(),
                request.protocols().join(", "),
            ));
        }
        if let Some(offer) = extension_offer {
            lines.push(("Sec-WebSocket-Extensions".into(), offer.to_string()));
        }
        if !request.cookies().is_empty() {
            let cookie = request
                .cookies()
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            lines.push(("Cookie".into(), cookie));
        }

        for (name, value) in request.headers() {
            let lower = name.to_ascii_lowercase();
            if lower == "host" {
                continue;
            }
            if MANAGED_HEADERS.contains(&lower.as_str()) {
                return Err(Error::InvalidHeaderValue {
                    header: name.clone(),
                    reason: "header is managed by the engine".into(),
                });
            }
            lines.push((name.clone(), value.clone()));
        }

        let mut bytes = Vec::with_capacity(256);
        bytes.extend_from_slice(format!("GET {} HTTP/1.1\r\n", endpoint.resource).as_bytes());
        for (name, value) in &lines {
            validate_header(name, value)?;
            bytes.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        bytes.extend_from_slice(b"\r\n");

        Ok(Self {
            key,
            protocols: request.protocols().to_vec(),
            bytes,
        })
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The `Sec-WebSocket-Accept` value a genuine server must return.
    #[must_use]
    pub fn expected_accept(&self) -> String {
        compute_accept_key(&self.key)
    }

    /// Sub-protocols offered.
    #[must_use]
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Wire form of the request.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Parsed upgrade response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// HTTP status code.
    pub status: u16,
    /// Reason phrase from the status line.
    pub reason: String,
    /// Headers keyed by lowercase name. Repeated headers are joined with ", ".
    pub headers: HashMap<String, String>,
}

impl HandshakeResponse {
    /// Parse a complete header block, as delimited by [`find_header_end`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if the data is not UTF-8, the status
    /// line is malformed, or `Sec-WebSocket-Accept` is repeated.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::InvalidHandshake("response is not valid UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        // "HTTP/1.1 101 Switching Protocols"
        let status_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| Error::InvalidHandshake("empty response".into()))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(Error::InvalidHandshake(format!(
                "invalid status line: {status_line}"
            )));
        }
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| Error::InvalidHandshake(format!("invalid status line: {status_line}")))?;
        let reason = parts.next().unwrap_or_default().trim().to_string();

        let mut headers: HashMap<String, String> = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(Error::InvalidHandshake(format!("malformed header line: {line}")));
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            match headers.get_mut(&name) {
                Some(_) if name == "sec-websocket-accept" => {
                    return Err(Error::InvalidHandshake(
                        "duplicate Sec-WebSocket-Accept header".into(),
                    ));
                }
                Some(existing) => {
                    existing.push_str(", ");
                    existing.push_str(value);
                }
                None => {
                    headers.insert(name, value.to_string());
                }
            }
        }

        Ok(Self {
            status,
            reason,
            headers,
        })
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Negotiated `Sec-WebSocket-Extensions`, if any.
    #[must_use]
    pub fn extensions(&self) -> Option<&str> {
        self.header("sec-websocket-extensions")
    }

    /// Selected `Sec-WebSocket-Protocol`, if any.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.header("sec-websocket-protocol")
    }

    /// Check this response against the request it answers.
    ///
    /// # Errors
    ///
    /// - `Error::UnexpectedStatus` if the status is not 101
    /// - `Error::InvalidHandshake` for a missing or wrong `Upgrade` or
    ///   `Connection` header, or a sub-protocol that was never offered
    /// - `Error::MissingAcceptKey` / `Error::AcceptKeyMismatch` if
    ///   `Sec-WebSocket-Accept` is absent or wrong
    pub fn validate(&self, request: &HandshakeRequest) -> Result<()> {
        if self.status != 101 {
            return Err(Error::UnexpectedStatus {
                code: self.status,
                reason: self.reason.clone(),
            });
        }

        match self.header("upgrade") {
            Some(upgrade) if upgrade.eq_ignore_ascii_case("websocket") => {}
            Some(upgrade) => {
                return Err(Error::InvalidHandshake(format!(
                    "invalid Upgrade header: {upgrade}"
                )));
            }
            None => return Err(Error::InvalidHandshake("missing Upgrade header".into())),
        }

        match self.header("connection") {
            Some(connection)
                if connection
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade")) => {}
            Some(connection) => {
                return Err(Error::InvalidHandshake(format!(
                    "invalid Connection header: {connection}"
                )));
            }
            None => return Err(Error::InvalidHandshake("missing Connection header".into())),
        }

        let actual = self.header("sec-websocket-accept").ok_or(Error::MissingAcceptKey)?;
        let expected = request.expected_accept();
        if actual != expected {
            return Err(Error::AcceptKeyMismatch {
                expected,
                actual: actual.to_string(),
            });
        }

        if let Some(protocol) = self.protocol() {
            if !request.protocols().iter().any(|p| p == protocol) {
                return Err(Error::InvalidHandshake(format!(
                    "server selected unrequested sub-protocol {protocol}"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const RFC_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn rfc_request(request: &Request) -> HandshakeRequest {
        let endpoint = request.endpoint(Duration::from_secs(10)).unwrap();
        HandshakeRequest::with_key(request, &endpoint, None, RFC_KEY.into()).unwrap()
    }

    fn response(lines: &str) -> HandshakeResponse {
        HandshakeResponse::parse(lines.as_bytes()).unwrap()
    }

    #[test]
    fn test_compute_accept_key_rfc_example() {
        assert_eq!(compute_accept_key(RFC_KEY), RFC_ACCEPT);
    }

    #[test]
    fn test_generate_key_is_16_bytes() {
        let key = generate_key().unwrap();
        assert_eq!(BASE64.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key().unwrap());
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"HTTP/1.1 101\r\n\r\nrest"), Some(16));
        assert_eq!(find_header_end(b"HTTP/1.1 101\r\n"), None);
    }

    #[test]
    fn test_request_bytes() {
        let request = Request::new("ws://server.example.com/chat?x=1")
            .unwrap()
            .with_protocol("chat")
            .with_protocol("superchat")
            .with_cookie("a", "1")
            .with_cookie("b", "2")
            .with_header("Origin", "http://example.com");
        let endpoint = request.endpoint(Duration::from_secs(10)).unwrap();
        let handshake = HandshakeRequest::with_key(
            &request,
            &endpoint,
            Some("permessage-deflate; client_max_window_bits"),
            RFC_KEY.into(),
        )
        .unwrap();

        let text = std::str::from_utf8(handshake.as_bytes()).unwrap();
        assert_eq!(
            text,
            "GET /chat?x=1 HTTP/1.1\r\n\
             Host: server.example.com\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Protocol: chat, superchat\r\n\
             Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n\
             Cookie: a=1; b=2\r\n\
             Origin: http://example.com\r\n\
             \r\n"
        );
        assert_eq!(handshake.expected_accept(), RFC_ACCEPT);
    }

    #[test]
    fn test_request_custom_host_replaces_default() {
        let request = Request::new("ws://10.0.0.1:9000/")
            .unwrap()
            .with_header("host", "virtual.example");
        let text = String::from_utf8(rfc_request(&request).as_bytes().to_vec()).unwrap();
        assert!(text.contains("Host: virtual.example\r\n"));
        assert!(!text.contains("10.0.0.1"));
    }

    #[test]
    fn test_request_rejects_crlf_injection() {
        let request = Request::new("ws://localhost/")
            .unwrap()
            .with_header("X-Evil", "a\r\nInjected: 1");
        let endpoint = request.endpoint(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            HandshakeRequest::with_key(&request, &endpoint, None, RFC_KEY.into()),
            Err(Error::InvalidHeaderValue { .. })
        ));
    }

    #[test]
    fn test_request_rejects_managed_header() {
        let request = Request::new("ws://localhost/")
            .unwrap()
            .with_header("Sec-WebSocket-Key", "forged");
        let endpoint = request.endpoint(Duration::from_secs(1)).unwrap();
        assert!(HandshakeRequest::new(&request, &endpoint, None).is_err());
    }

    #[test]
    fn test_valid_response() {
        let request = Request::new("ws://localhost/").unwrap();
        let handshake = rfc_request(&request);
        let response = response(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: WebSocket\r\n\
             Connection: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
             \r\n",
        );
        assert_eq!(response.status, 101);
        assert_eq!(response.reason, "Switching Protocols");
        assert!(response.validate(&handshake).is_ok());
    }

    #[test]
    fn test_accept_mismatch_is_security_error() {
        let request = Request::new("ws://localhost/").unwrap();
        let handshake = rfc_request(&request);
        let response = response(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: AAAAAAAAAAAAAAAAAAAAAAAAAAA=\r\n\
             \r\n",
        );
        let err = response.validate(&handshake).unwrap_err();
        assert!(matches!(err, Error::AcceptKeyMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::Security);
    }

    #[test]
    fn test_missing_accept_is_security_error() {
        let request = Request::new("ws://localhost/").unwrap();
        let handshake = rfc_request(&request);
        let response = response(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             \r\n",
        );
        assert_eq!(response.validate(&handshake), Err(Error::MissingAcceptKey));
    }

    #[test]
    fn test_non_101_status_is_server_error() {
        let request = Request::new("ws://localhost/").unwrap();
        let handshake = rfc_request(&request);
        let response = response("HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n");
        let err = response.validate(&handshake).unwrap_err();
        assert_eq!(
            err,
            Error::UnexpectedStatus {
                code: 403,
                reason: "Forbidden".into()
            }
        );
        assert_eq!(err.kind(), ErrorKind::Server);
    }

    #[test]
    fn test_missing_upgrade_headers() {
        let request = Request::new("ws://localhost/").unwrap();
        let handshake = rfc_request(&request);

        let no_upgrade = response(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
        );
        assert!(matches!(
            no_upgrade.validate(&handshake),
            Err(Error::InvalidHandshake(msg)) if msg.contains("Upgrade")
        ));

        let bad_connection = response(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: close\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
        );
        assert!(matches!(
            bad_connection.validate(&handshake),
            Err(Error::InvalidHandshake(msg)) if msg.contains("Connection")
        ));
    }

    #[test]
    fn test_unrequested_protocol_rejected() {
        let request = Request::new("ws://localhost/").unwrap().with_protocol("chat");
        let handshake = rfc_request(&request);
        let ok = response(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
             Sec-WebSocket-Protocol: chat\r\n\r\n",
        );
        assert!(ok.validate(&handshake).is_ok());
        assert_eq!(ok.protocol(), Some("chat"));

        let bad = response(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
             Sec-WebSocket-Protocol: other\r\n\r\n",
        );
        assert!(bad.validate(&handshake).is_err());
    }

    #[test]
    fn test_repeated_headers_are_joined() {
        let response = response(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Sec-WebSocket-Extensions: permessage-deflate\r\n\
             sec-websocket-extensions: x-other\r\n\r\n",
        );
        assert_eq!(response.extensions(), Some("permessage-deflate, x-other"));
    }

    #[test]
    fn test_duplicate_accept_rejected() {
        let result = HandshakeResponse::parse(
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Sec-WebSocket-Accept: a\r\n\
              Sec-WebSocket-Accept: b\r\n\r\n",
        );
        assert!(matches!(result, Err(Error::InvalidHandshake(_))));
    }

    #[test]
    fn test_malformed_status_line() {
        assert!(HandshakeResponse::parse(b"garbage\r\n\r\n").is_err());
        assert!(HandshakeResponse::parse(b"HTTP/1.1 abc Nope\r\n\r\n").is_err());
        assert!(HandshakeResponse::parse(b"").is_err());
    }
}
