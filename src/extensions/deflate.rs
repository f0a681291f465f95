//! Permessage-deflate WebSocket compression extension (RFC 7692).

use crate::error::{Error, Result};
#[cfg(feature = "compression")]
use crate::extensions::{CompressionHandler, ExtensionOffer, ExtensionParam};

#[cfg(feature = "compression")]
use bytes::Bytes;
#[cfg(feature = "compression")]
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Extension token.
pub const EXTENSION_NAME: &str = "permessage-deflate";

const MIN_WINDOW_BITS: u8 = 9;
const MAX_WINDOW_BITS: u8 = 15;
#[cfg(feature = "compression")]
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// What the client offers for permessage-deflate.
///
/// The `client_*` values bound our compressor; the `server_*` values are
/// requests for how the server compresses towards us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateConfig {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: u8,
    pub client_max_window_bits: u8,
    pub compression_level: u32,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: MAX_WINDOW_BITS,
            client_max_window_bits: MAX_WINDOW_BITS,
            compression_level: 6,
        }
    }
}

impl DeflateConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn server_no_context_takeover(mut self, value: bool) -> Self {
        self.server_no_context_takeover = value;
        self
    }

    #[must_use]
    pub fn client_no_context_takeover(mut self, value: bool) -> Self {
        self.client_no_context_takeover = value;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] unless `bits` is in 9..=15.
    pub fn server_max_window_bits(mut self, bits: u8) -> Result<Self> {
        self.server_max_window_bits = check_window_bits("server_max_window_bits", bits)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] unless `bits` is in 9..=15.
    pub fn client_max_window_bits(mut self, bits: u8) -> Result<Self> {
        self.client_max_window_bits = check_window_bits("client_max_window_bits", bits)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] if `level` is above 9.
    pub fn compression_level(mut self, level: u32) -> Result<Self> {
        if level > 9 {
            return Err(Error::InvalidExtension(format!(
                "compression_level must be 0-9, got {}",
                level
            )));
        }
        self.compression_level = level;
        Ok(self)
    }

    /// `Sec-WebSocket-Extensions` value for the upgrade request.
    #[must_use]
    pub fn offer_header(&self) -> String {
        let mut offer = String::from(EXTENSION_NAME);
        if self.client_no_context_takeover {
            offer.push_str("; client_no_context_takeover");
        }
        if self.server_no_context_takeover {
            offer.push_str("; server_no_context_takeover");
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            offer.push_str(&format!(
                "; client_max_window_bits={}",
                self.client_max_window_bits
            ));
        } else {
            offer.push_str("; client_max_window_bits");
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            offer.push_str(&format!(
                "; server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        offer
    }
}

fn check_window_bits(name: &str, bits: u8) -> Result<u8> {
    if (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        Ok(bits)
    } else {
        Err(Error::InvalidExtension(format!(
            "{name} must be {MIN_WINDOW_BITS}-{MAX_WINDOW_BITS}, got {bits}"
        )))
    }
}

/// Parameters agreed with the server.
#[cfg(feature = "compression")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedDeflate {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: u8,
    pub server_max_window_bits: u8,
}

#[cfg(feature = "compression")]
impl NegotiatedDeflate {
    fn from_response(config: &DeflateConfig, response: &ExtensionOffer) -> Result<Self> {
        let mut negotiated = Self {
            client_no_context_takeover: config.client_no_context_takeover,
            server_no_context_takeover: false,
            client_max_window_bits: config.client_max_window_bits,
            server_max_window_bits: MAX_WINDOW_BITS,
        };
        let mut seen: Vec<&str> = Vec::with_capacity(response.params.len());

        for param in &response.params {
            if seen.contains(&param.name.as_str()) {
                return Err(Error::InvalidExtension(format!(
                    "duplicate parameter {}",
                    param.name
                )));
            }
            seen.push(&param.name);

            match param.name.as_str() {
                "server_no_context_takeover" => {
                    flag_only(param)?;
                    negotiated.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    flag_only(param)?;
                    negotiated.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    let bits = parse_window_bits(param)?;
                    if bits > config.server_max_window_bits {
                        return Err(Error::InvalidExtension(format!(
                            "server_max_window_bits={bits} exceeds the offered {}",
                            config.server_max_window_bits
                        )));
                    }
                    negotiated.server_max_window_bits = bits;
                }
                "client_max_window_bits" => {
                    let bits = parse_window_bits(param)?;
                    if bits < MIN_WINDOW_BITS {
                        return Err(Error::InvalidExtension(format!(
                            "client_max_window_bits={bits} cannot be honoured"
                        )));
                    }
                    negotiated.client_max_window_bits =
                        negotiated.client_max_window_bits.min(bits);
                }
                other => {
                    return Err(Error::InvalidExtension(format!(
                        "unknown parameter {other}"
                    )));
                }
            }
        }
        Ok(negotiated)
    }
}

#[cfg(feature = "compression")]
fn flag_only(param: &ExtensionParam) -> Result<()> {
    match param.value {
        None => Ok(()),
        Some(_) => Err(Error::InvalidExtension(format!(
            "{} does not take a value",
            param.name
        ))),
    }
}

/// The server may announce any value in 8..=15; inflating with a window of
/// 9 reads streams produced with 8.
#[cfg(feature = "compression")]
fn parse_window_bits(param: &ExtensionParam) -> Result<u8> {
    let value = param.value.as_deref().ok_or_else(|| {
        Error::InvalidExtension(format!("{} requires a value", param.name))
    })?;
    let bits: u8 = value.parse().map_err(|_| {
        Error::InvalidExtension(format!("invalid {} value {value:?}", param.name))
    })?;
    if !(8..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(Error::InvalidExtension(format!(
            "{} out of range (8-15): {bits}",
            param.name
        )));
    }
    Ok(bits)
}

/// Stateful permessage-deflate codec for the client side of a connection.
#[cfg(feature = "compression")]
pub struct PerMessageDeflate {
    config: DeflateConfig,
    negotiated: Option<NegotiatedDeflate>,
    compress: Option<Compress>,
    decompress: Option<Decompress>,
}

#[cfg(feature = "compression")]
impl std::fmt::Debug for PerMessageDeflate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerMessageDeflate")
            .field("config", &self.config)
            .field("negotiated", &self.negotiated)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "compression")]
impl PerMessageDeflate {
    #[must_use]
    pub fn new(config: DeflateConfig) -> Self {
        Self {
            config,
            negotiated: None,
            compress: None,
            decompress: None,
        }
    }

    /// Parameters in force, once negotiated.
    #[must_use]
    pub fn negotiated(&self) -> Option<&NegotiatedDeflate> {
        self.negotiated.as_ref()
    }

    fn not_negotiated() -> Error {
        Error::Compression("permessage-deflate used before negotiation".into())
    }
}

#[cfg(feature = "compression")]
impl CompressionHandler for PerMessageDeflate {
    fn name(&self) -> &str {
        EXTENSION_NAME
    }

    fn offer(&self) -> ExtensionOffer {
        // offer_header always yields a non-empty name.
        ExtensionOffer::parse(&self.config.offer_header())
            .unwrap_or_else(|_| ExtensionOffer::new(EXTENSION_NAME))
    }

    fn negotiate(&mut self, response: &ExtensionOffer) -> Result<()> {
        let negotiated = NegotiatedDeflate::from_response(&self.config, response)?;
        tracing::debug!(?negotiated, "permessage-deflate negotiated");

        let level = Compression::new(self.config.compression_level);
        self.compress = Some(Compress::new_with_window_bits(
            level,
            false,
            negotiated.client_max_window_bits,
        ));
        self.decompress = Some(Decompress::new_with_window_bits(
            false,
            negotiated.server_max_window_bits.max(MIN_WINDOW_BITS),
        ));
        self.negotiated = Some(negotiated);
        Ok(())
    }

    fn compress(&mut self, payload: &[u8]) -> Result<Bytes> {
        let negotiated = self.negotiated.ok_or_else(Self::not_negotiated)?;
        let compress = self.compress.as_mut().ok_or_else(Self::not_negotiated)?;

        if negotiated.client_no_context_takeover {
            compress.reset();
        }

        let start_in = compress.total_in();
        let mut output = Vec::with_capacity(payload.len() / 2 + 64);
        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(4096));
            }
            let consumed = (compress.total_in() - start_in) as usize;
            compress
                .compress_vec(&payload[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("deflate error: {e}")))?;

            let consumed = (compress.total_in() - start_in) as usize;
            if consumed == payload.len() && output.len() < output.capacity() {
                break;
            }
        }

        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }
        Ok(Bytes::from(output))
    }

    fn decompress(&mut self, payload: &[u8], max_size: usize) -> Result<Bytes> {
        let negotiated = self.negotiated.ok_or_else(Self::not_negotiated)?;
        let decompress = self.decompress.as_mut().ok_or_else(Self::not_negotiated)?;

        if negotiated.server_no_context_takeover {
            decompress.reset(false);
        }
        if payload.is_empty() {
            return Ok(Bytes::new());
        }

        let mut input = Vec::with_capacity(payload.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let start_in = decompress.total_in();
        let initial = (payload.len() * 4)
            .max(1024)
            .min(max_size.saturating_add(1));
        let mut output = Vec::with_capacity(initial);
        loop {
            if output.len() == output.capacity() {
                let room = max_size.saturating_add(1).saturating_sub(output.len());
                output.reserve(output.capacity().max(4096).min(room).max(1));
            }
            let consumed_before = (decompress.total_in() - start_in) as usize;
            let produced_before = output.len();
            let status = decompress
                .decompress_vec(&input[consumed_before..], &mut output, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(format!("inflate error: {e}")))?;

            if output.len() > max_size {
                return Err(Error::MessageTooLarge {
                    size: output.len(),
                    max: max_size,
                });
            }

            let consumed = (decompress.total_in() - start_in) as usize;
            let has_room = output.len() < output.capacity();
            if status == Status::StreamEnd || (consumed == input.len() && has_room) {
                break;
            }
            if has_room && consumed == consumed_before && output.len() == produced_before {
                return Err(Error::Compression("truncated deflate stream".into()));
            }
        }

        Ok(Bytes::from(output))
    }
}

#[cfg(all(test, feature = "compression"))]
mod tests {
    use super::*;

    fn negotiated(config: DeflateConfig, response: &str) -> Result<PerMessageDeflate> {
        let mut codec = PerMessageDeflate::new(config);
        codec.negotiate(&ExtensionOffer::parse(response)?)?;
        Ok(codec)
    }

    /// A pair where `client` compresses for `server` to decompress.
    fn pair(response: &str) -> (PerMessageDeflate, PerMessageDeflate) {
        let client = negotiated(DeflateConfig::default(), response).unwrap();
        // Mirror the response so the peer inflates with the client's parameters.
        let mirrored = response
            .replace("client_", "tmp_")
            .replace("server_", "client_")
            .replace("tmp_", "server_");
        let server = negotiated(DeflateConfig::default(), &mirrored).unwrap();
        (client, server)
    }

    #[test]
    fn test_compression_roundtrip() {
        let (mut client, mut server) = pair("permessage-deflate");
        let data = b"Hello, WebSocket! This is a test message that should compress well. \
                     Hello, WebSocket! This is a test message that should compress well.";

        let compressed = client.compress(data).unwrap();
        assert!(compressed.len() < data.len());
        assert!(!compressed.ends_with(&DEFLATE_TRAILER));

        let restored = server.decompress(&compressed, 1 << 20).unwrap();
        assert_eq!(&restored[..], &data[..]);
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let (mut client, mut server) = pair("permessage-deflate");
        let compressed = client.compress(b"").unwrap();
        let restored = server.decompress(&compressed, 1024).unwrap();
        assert!(restored.is_empty());
        assert!(server.decompress(b"", 1024).unwrap().is_empty());
    }

    #[test]
    fn test_context_takeover_shrinks_repeats() {
        let (mut client, mut server) = pair("permessage-deflate");
        let data = b"the same sentence repeated across messages, again and again";

        let first = client.compress(data).unwrap();
        let second = client.compress(data).unwrap();
        assert!(second.len() < first.len());

        assert_eq!(&server.decompress(&first, 1024).unwrap()[..], &data[..]);
        assert_eq!(&server.decompress(&second, 1024).unwrap()[..], &data[..]);
    }

    #[test]
    fn test_no_context_takeover_is_stateless() {
        let (mut client, mut server) =
            pair("permessage-deflate; client_no_context_takeover; server_no_context_takeover");
        let data = b"the same sentence repeated across messages, again and again";

        let first = client.compress(data).unwrap();
        let second = client.compress(data).unwrap();
        assert_eq!(first, second);

        assert_eq!(&server.decompress(&second, 1024).unwrap()[..], &data[..]);
        assert_eq!(&server.decompress(&first, 1024).unwrap()[..], &data[..]);
    }

    #[test]
    fn test_reduced_window_roundtrip() {
        let (mut client, mut server) =
            pair("permessage-deflate; client_max_window_bits=9; server_max_window_bits=10");
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = client.compress(&data).unwrap();
        assert_eq!(&server.decompress(&compressed, 1 << 20).unwrap()[..], &data[..]);
    }

    #[test]
    fn test_garbage_is_compression_error() {
        let (_, mut server) = pair("permessage-deflate");
        let result = server.decompress(&[0xff, 0xff, 0xff, 0xff, 0xff], 1024);
        assert!(matches!(result, Err(Error::Compression(_))));
    }

    #[test]
    fn test_inflate_bounded_by_max_size() {
        let (mut client, mut server) = pair("permessage-deflate");
        let data = vec![b'a'; 100_000];
        let compressed = client.compress(&data).unwrap();
        assert!(matches!(
            server.decompress(&compressed, 1000),
            Err(Error::MessageTooLarge { max: 1000, .. })
        ));
    }

    #[test]
    fn test_use_before_negotiation() {
        let mut codec = PerMessageDeflate::new(DeflateConfig::default());
        assert!(codec.compress(b"x").is_err());
        assert!(codec.negotiated().is_none());
    }

    #[test]
    fn test_negotiated_parameters() {
        let config = DeflateConfig::new().client_max_window_bits(12).unwrap();
        let codec = negotiated(
            config,
            "permessage-deflate; server_no_context_takeover; client_max_window_bits=14; server_max_window_bits=8",
        )
        .unwrap();
        let params = codec.negotiated().unwrap();
        assert!(params.server_no_context_takeover);
        assert!(!params.client_no_context_takeover);
        assert_eq!(params.client_max_window_bits, 12);
        assert_eq!(params.server_max_window_bits, 8);
    }

    #[test]
    fn test_negotiation_errors() {
        let default = DeflateConfig::default;
        assert!(negotiated(default(), "permessage-deflate; client_max_window_bits=8").is_err());
        assert!(negotiated(default(), "permessage-deflate; server_max_window_bits").is_err());
        assert!(negotiated(default(), "permessage-deflate; server_max_window_bits=16").is_err());
        assert!(negotiated(default(), "permessage-deflate; mystery").is_err());
        assert!(negotiated(default(), "permessage-deflate; server_no_context_takeover=1").is_err());
        assert!(
            negotiated(
                default(),
                "permessage-deflate; client_no_context_takeover; client_no_context_takeover"
            )
            .is_err()
        );

        let limited = DeflateConfig::new().server_max_window_bits(10).unwrap();
        assert!(negotiated(limited, "permessage-deflate; server_max_window_bits=12").is_err());
    }

    #[test]
    fn test_offer_header() {
        assert_eq!(
            DeflateConfig::default().offer_header(),
            "permessage-deflate; client_max_window_bits"
        );
        let config = DeflateConfig::new()
            .client_no_context_takeover(true)
            .server_no_context_takeover(true)
            .client_max_window_bits(10)
            .unwrap()
            .server_max_window_bits(11)
            .unwrap();
        assert_eq!(
            config.offer_header(),
            "permessage-deflate; client_no_context_takeover; server_no_context_takeover; \
             client_max_window_bits=10; server_max_window_bits=11"
        );
        let codec = PerMessageDeflate::new(config);
        assert_eq!(codec.offer().to_string(), codec.config.offer_header());
    }

    #[test]
    fn test_window_bits_validation() {
        assert!(DeflateConfig::new().client_max_window_bits(8).is_err());
        assert!(DeflateConfig::new().server_max_window_bits(16).is_err());
        assert!(DeflateConfig::new().client_max_window_bits(9).is_ok());
    }

    #[test]
    fn test_compression_level_validation() {
        assert!(DeflateConfig::new().compression_level(9).is_ok());
        assert!(DeflateConfig::new().compression_level(10).is_err());
    }
}
