//! Connection requests and the endpoints derived from them.

use std::time::Duration;

use http::Uri;

use crate::error::{Error, Result};

/// What the caller asks the engine to connect to.
///
/// ```
/// use rsws_engine::Request;
///
/// let request = Request::new("wss://example.com/chat?room=1")
///     .unwrap()
///     .with_protocol("chat")
///     .with_header("Origin", "https://example.com")
///     .with_cookie("session", "abc");
/// assert_eq!(request.uri().path(), "/chat");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    uri: Uri,
    headers: Vec<(String, String)>,
    protocols: Vec<String>,
    cookies: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl Request {
    /// Parse a `ws://` or `wss://` URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the URL does not parse, has no host, or
    /// uses another scheme.
    pub fn new(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e: http::uri::InvalidUri| Error::InvalidUrl(format!("{url}: {e}")))?;
        Self::from_uri(uri)
    }

    /// # Errors
    ///
    /// Same conditions as [`Request::new`].
    pub fn from_uri(uri: Uri) -> Result<Self> {
        match uri.scheme_str() {
            Some("ws" | "wss") => {}
            Some(other) => {
                return Err(Error::InvalidUrl(format!("unsupported scheme {other}")));
            }
            None => return Err(Error::InvalidUrl("missing scheme".into())),
        }
        if uri.host().is_none_or(str::is_empty) {
            return Err(Error::InvalidUrl("missing host".into()));
        }
        Ok(Self {
            uri,
            headers: Vec::new(),
            protocols: Vec::new(),
            cookies: Vec::new(),
            timeout: None,
        })
    }

    /// Add an extra request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Offer a sub-protocol in `Sec-WebSocket-Protocol`.
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Send a cookie; all cookies are folded into one `Cookie` header.
    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Override [`Timeouts::connect`](crate::config::Timeouts::connect) for this request.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    #[must_use]
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    #[must_use]
    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Resolve where and how to connect.
    ///
    /// `default_timeout` applies unless the request carries its own.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the host is missing.
    pub fn endpoint(&self, default_timeout: Duration) -> Result<Endpoint> {
        let tls = self.uri.scheme_str() == Some("wss");
        let default_port = if tls { 443 } else { 80 };
        let authority_host = self
            .uri
            .host()
            .ok_or_else(|| Error::InvalidUrl("missing host".into()))?;
        let port = self.uri.port_u16().unwrap_or(default_port);

        let host_header = if port == default_port {
            authority_host.to_string()
        } else {
            format!("{authority_host}:{port}")
        };

        let resource = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");
        let resource = if resource.starts_with('/') {
            resource.to_string()
        } else {
            format!("/{resource}")
        };

        Ok(Endpoint {
            host: authority_host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string(),
            port,
            tls,
            resource,
            host_header,
            timeout: self.timeout.unwrap_or(default_timeout),
        })
    }
}

/// Resolved connection target for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or IP literal, without IPv6 brackets.
    pub host: String,
    pub port: u16,
    /// Wrap the TCP stream in TLS.
    pub tls: bool,
    /// Path and query for the request line.
    pub resource: String,
    /// Value of the `Host` header.
    pub host_header: String,
    /// Bound on TCP connect plus TLS handshake.
    pub timeout: Duration,
}
