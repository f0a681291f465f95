//! Close codes and close frame payloads (RFC 6455 Section 7.4).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// WebSocket close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum CloseCode {
    /// Normal closure (1000).
    #[default]
    Normal,
    /// Going away (1001), e.g. server shutdown.
    GoingAway,
    /// Protocol error (1002).
    ProtocolError,
    /// Unsupported data (1003).
    UnsupportedData,
    /// No status code was present (1005). Never sent on the wire.
    NoStatusReceived,
    /// Connection dropped without a close frame (1006). Never sent on the wire.
    Abnormal,
    /// Invalid payload data (1007), e.g. non-UTF-8 text.
    InvalidPayload,
    /// Policy violation (1008).
    PolicyViolation,
    /// Message too big (1009).
    MessageTooBig,
    /// Client expected an extension the server did not negotiate (1010).
    MandatoryExtension,
    /// Server hit an unexpected condition (1011).
    InternalError,
    /// Service restart (1012).
    ServiceRestart,
    /// Try again later (1013).
    TryAgainLater,
    /// Bad gateway (1014).
    BadGateway,
    /// TLS handshake failure (1015). Never sent on the wire.
    TlsHandshake,
    /// Any other code, e.g. application codes 3000-4999.
    Other(u16),
}

impl CloseCode {
    #[must_use]
    pub const fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1005 => CloseCode::NoStatusReceived,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::InternalError,
            1012 => CloseCode::ServiceRestart,
            1013 => CloseCode::TryAgainLater,
            1014 => CloseCode::BadGateway,
            1015 => CloseCode::TlsHandshake,
            other => CloseCode::Other(other),
        }
    }

    #[must_use]
    pub const fn as_u16(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::NoStatusReceived => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::InternalError => 1011,
            CloseCode::ServiceRestart => 1012,
            CloseCode::TryAgainLater => 1013,
            CloseCode::BadGateway => 1014,
            CloseCode::TlsHandshake => 1015,
            CloseCode::Other(code) => *code,
        }
    }

    /// Whether an endpoint may put this code in a close frame.
    ///
    /// 1000-1003, 1007-1014 and 3000-4999 are allowed. 1005, 1006 and 1015
    /// only ever describe a closure locally.
    #[must_use]
    pub const fn is_sendable(&self) -> bool {
        matches!(self.as_u16(), 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self::from_u16(code)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

/// Decoded close frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    /// UTF-8 reason, empty when absent.
    pub reason: String,
}

impl CloseFrame {
    #[must_use]
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Parse the payload of a received close frame.
    ///
    /// An empty payload carries no status, which is reported as
    /// [`CloseCode::NoStatusReceived`].
    ///
    /// # Errors
    ///
    /// - `Error::ProtocolViolation` for a 1-byte payload or a code that may not be sent
    /// - `Error::InvalidUtf8` if the reason is not UTF-8
    pub fn parse(payload: &[u8]) -> Result<Self> {
        match payload {
            [] => Ok(Self::new(CloseCode::NoStatusReceived, "")),
            [_] => Err(Error::ProtocolViolation(
                "close frame payload of 1 byte".into(),
            )),
            [hi, lo, reason @ ..] => {
                let code = CloseCode::from_u16(u16::from_be_bytes([*hi, *lo]));
                if !code.is_sendable() {
                    return Err(Error::ProtocolViolation(format!(
                        "close code {} is not allowed on the wire",
                        code.as_u16()
                    )));
                }
                let reason = std::str::from_utf8(reason)?;
                Ok(Self::new(code, reason))
            }
        }
    }

    /// Wire payload for this close frame.
    #[must_use]
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.reason.len());
        buf.put_u16(self.code.as_u16());
        buf.extend_from_slice(self.reason.as_bytes());
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_roundtrip() {
        for code in [1000u16, 1001, 1002, 1003, 1005, 1006, 1007, 1011, 1015, 3000, 4999] {
            assert_eq!(CloseCode::from_u16(code).as_u16(), code);
        }
        assert_eq!(CloseCode::from(4000), CloseCode::Other(4000));
        assert_eq!(u16::from(CloseCode::GoingAway), 1001);
    }

    #[test]
    fn test_sendable_codes() {
        assert!(CloseCode::Normal.is_sendable());
        assert!(CloseCode::BadGateway.is_sendable());
        assert!(CloseCode::Other(3500).is_sendable());
        assert!(!CloseCode::NoStatusReceived.is_sendable());
        assert!(!CloseCode::Abnormal.is_sendable());
        assert!(!CloseCode::TlsHandshake.is_sendable());
        assert!(!CloseCode::Other(1004).is_sendable());
        assert!(!CloseCode::Other(2000).is_sendable());
    }

    #[test]
    fn test_parse_empty_payload() {
        let close = CloseFrame::parse(&[]).unwrap();
        assert_eq!(close.code, CloseCode::NoStatusReceived);
        assert_eq!(close.reason, "");
    }

    #[test]
    fn test_parse_code_and_reason() {
        let close = CloseFrame::parse(&[0x03, 0xe9, b'b', b'y', b'e']).unwrap();
        assert_eq!(close, CloseFrame::new(CloseCode::GoingAway, "bye"));
    }

    #[test]
    fn test_parse_rejects_single_byte() {
        assert!(matches!(
            CloseFrame::parse(&[0x03]),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_parse_rejects_invalid_utf8_reason() {
        assert_eq!(
            CloseFrame::parse(&[0x03, 0xe8, 0xff, 0xfe]),
            Err(Error::InvalidUtf8)
        );
    }

    #[test]
    fn test_parse_rejects_reserved_code() {
        assert!(CloseFrame::parse(&1005u16.to_be_bytes()).is_err());
    }

    #[test]
    fn test_to_payload() {
        let payload = CloseFrame::new(CloseCode::Normal, "done").to_payload();
        assert_eq!(&payload[..], &[0x03, 0xe8, b'd', b'o', b'n', b'e']);
    }
}
