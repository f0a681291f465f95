//! WebSocket extension negotiation (RFC 6455 Section 9).
//!
//! The only extension the engine drives is message compression. A
//! [`CompressionHandler`] produces the `Sec-WebSocket-Extensions` offer for the
//! upgrade request, is configured from the server's answer, and then
//! transforms every data message in both directions.
//!
//! ```
//! use rsws_engine::extensions::ExtensionOffer;
//!
//! let offers = ExtensionOffer::parse_header(
//!     "permessage-deflate; server_no_context_takeover; client_max_window_bits=10",
//! )
//! .unwrap();
//! assert_eq!(offers[0].name, "permessage-deflate");
//! assert!(offers[0].has_param("server_no_context_takeover"));
//! ```

pub mod deflate;

use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};

/// `name` or `name=value` inside an extension element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    /// Lowercase parameter name, e.g. `client_max_window_bits`.
    pub name: String,
    /// `None` for flags such as `server_no_context_takeover`.
    pub value: Option<String>,
}

impl ExtensionParam {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Names are case-insensitive on the wire and stored lowercase; a quoted
    /// value is unquoted.
    pub fn parse(raw: &str) -> Self {
        let (name, value) = match raw.split_once('=') {
            Some((name, value)) => (name, Some(value.trim().trim_matches('"').to_string())),
            None => (raw, None),
        };
        Self {
            name: name.trim().to_ascii_lowercase(),
            value,
        }
    }
}

impl fmt::Display for ExtensionParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(value) = &self.value {
            write!(f, "={value}")?;
        }
        Ok(())
    }
}

/// One element of a `Sec-WebSocket-Extensions` header.
///
/// For example: `permessage-deflate; client_max_window_bits=15`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    /// Extension name (e.g., "permessage-deflate").
    pub name: String,
    /// Extension parameters in header order.
    pub params: Vec<ExtensionParam>,
}

impl ExtensionOffer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Append a parameter.
    #[must_use]
    pub fn with_param(mut self, param: ExtensionParam) -> Self {
        self.params.push(param);
        self
    }

    /// Parse `extension-name; param1=value1; param2`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] if the extension name is empty.
    pub fn parse(element: &str) -> Result<Self> {
        let (name, rest) = element.split_once(';').unwrap_or((element, ""));
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(Error::InvalidExtension(format!(
                "missing extension name in {element:?}"
            )));
        }
        let params = rest
            .split(';')
            .filter(|raw| !raw.trim().is_empty())
            .map(ExtensionParam::parse)
            .collect();
        Ok(Self { name, params })
    }

    /// Parse a whole header value: elements separated by commas.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] if any element is invalid.
    pub fn parse_header(header: &str) -> Result<Vec<Self>> {
        header.split(',').map(Self::parse).collect()
    }

    pub fn get_param(&self, name: &str) -> Option<&ExtensionParam> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }
}

impl fmt::Display for ExtensionOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        self.params
            .iter()
            .try_for_each(|param| write!(f, "; {param}"))?;
        Ok(())
    }
}

/// Message compression negotiated through `Sec-WebSocket-Extensions`.
///
/// A handler is created per connection attempt and owned by the connection
/// task, so implementations only need to be `Send`.
pub trait CompressionHandler: Send {
    /// Extension token, e.g. `permessage-deflate`.
    fn name(&self) -> &str;

    /// The offer to put in the upgrade request.
    fn offer(&self) -> ExtensionOffer;

    /// Configure from the server's accepted parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] if the parameters are unknown,
    /// repeated, out of range or incompatible with the offer.
    fn negotiate(&mut self, response: &ExtensionOffer) -> Result<()>;

    /// Compress one outgoing message payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compression`] if the compressor fails.
    fn compress(&mut self, payload: &[u8]) -> Result<Bytes>;

    /// Decompress one incoming message payload, producing at most `max_size` bytes.
    ///
    /// # Errors
    ///
    /// - `Error::Compression` if the payload is not a valid compressed stream
    /// - `Error::MessageTooLarge` if the output would exceed `max_size`
    fn decompress(&mut self, payload: &[u8], max_size: usize) -> Result<Bytes>;
}

/// Apply the server's `Sec-WebSocket-Extensions` answer to the handler.
///
/// Returns `true` when compression is active for the connection. A missing
/// header leaves compression off even if it was offered.
///
/// # Errors
///
/// Returns [`Error::InvalidExtension`] if the server accepted an extension
/// that was not offered, accepted one twice, or sent parameters the handler
/// rejects.
pub fn negotiate_response(
    handler: Option<&mut (dyn CompressionHandler + 'static)>,
    header: Option<&str>,
) -> Result<bool> {
    let Some(header) = header.filter(|h| !h.trim().is_empty()) else {
        return Ok(false);
    };
    let offers = ExtensionOffer::parse_header(header)?;
    let Some(handler) = handler else {
        return Err(Error::InvalidExtension(format!(
            "server accepted extension {} that was not offered",
            offers[0].name
        )));
    };

    let mut accepted = false;
    for offer in &offers {
        if offer.name != handler.name() {
            return Err(Error::InvalidExtension(format!(
                "server accepted extension {} that was not offered",
                offer.name
            )));
        }
        if accepted {
            return Err(Error::InvalidExtension(format!(
                "server accepted {} more than once",
                offer.name
            )));
        }
        handler.negotiate(offer)?;
        accepted = true;
    }
    Ok(accepted)
}
