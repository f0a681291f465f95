//! Error types for the WebSocket client engine.
//!
//! Every failure the engine can report is a variant of [`Error`]. Variants are
//! grouped into the categories of [`ErrorKind`], which decide how the engine
//! reacts: security, protocol, compression and server errors are always fatal
//! to the connection, transport errors surface whatever the socket reported,
//! and usage errors are returned to the caller without touching the connection.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for WebSocket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Handshake spoofing or a rejected TLS identity.
    Security,
    /// Malformed or illegal frames received from the server.
    Protocol,
    /// permessage-deflate negotiation or inflate/deflate failure.
    Compression,
    /// Socket, TLS or timeout failure.
    Transport,
    /// The server answered the upgrade request incorrectly.
    Server,
    /// The caller misused the API (bad URL, write while closed, ...).
    Usage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Security => "security",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Compression => "compression",
            ErrorKind::Transport => "transport",
            ErrorKind::Server => "server",
            ErrorKind::Usage => "usage",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while driving a WebSocket connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Invalid frame structure or header.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Protocol violation detected.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid UTF-8 in a text message or close reason.
    #[error("Invalid UTF-8 in text payload")]
    InvalidUtf8,

    /// A 64-bit payload length with the most significant bit set.
    #[error("Invalid payload length: {0:#x}")]
    InvalidPayloadLength(u64),

    /// Frame size exceeds configured maximum.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Length announced by the frame header.
        size: u64,
        /// Maximum allowed size.
        max: usize,
    },

    /// Message size exceeds configured maximum.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Too many fragments in a single message.
    #[error("Too many fragments: {count} (max: {max})")]
    TooManyFragments {
        /// Actual fragment count.
        count: usize,
        /// Maximum allowed fragments.
        max: usize,
    },

    /// Reserved opcode received.
    #[error("Reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// Control frame fragmented (RFC violation).
    #[error("Control frames cannot be fragmented")]
    FragmentedControlFrame,

    /// Control frame payload too large (>125 bytes).
    #[error("Control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    /// Masked frame received from the server.
    #[error("Server frame must not be masked")]
    MaskedServerFrame,

    /// Unmasked frame received by a decoder acting for the server side.
    #[error("Client frame must be masked")]
    UnmaskedClientFrame,

    /// Reserved bits set without a negotiated extension.
    #[error("Reserved bits set without negotiated extension")]
    ReservedBitsSet,

    /// Inflate or deflate failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Extension negotiation failed.
    #[error("Invalid extension: {0}")]
    InvalidExtension(String),

    /// `Sec-WebSocket-Accept` did not match the key we sent.
    #[error("Sec-WebSocket-Accept mismatch: expected {expected}, got {actual}")]
    AcceptKeyMismatch {
        /// Value derived from our request key.
        expected: String,
        /// Value the server sent.
        actual: String,
    },

    /// `Sec-WebSocket-Accept` missing from the upgrade response.
    #[error("Missing Sec-WebSocket-Accept header")]
    MissingAcceptKey,

    /// The trust evaluator rejected the peer certificate chain.
    #[error("Untrusted certificate: {0}")]
    UntrustedCertificate(String),

    /// The server answered with something other than `101 Switching Protocols`.
    #[error("Unexpected HTTP status {code}: {reason}")]
    UnexpectedStatus {
        /// HTTP status code.
        code: u16,
        /// Reason phrase from the status line.
        reason: String,
    },

    /// Invalid WebSocket handshake response.
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    /// Handshake response exceeds configured maximum.
    #[error("Handshake too large: {size} bytes (max: {max})")]
    HandshakeTooLarge {
        /// Bytes received so far.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),

    /// TLS negotiation failed for a reason other than trust evaluation.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connecting took longer than the endpoint timeout.
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// The stream ended before the WebSocket was established.
    #[error("Connection closed: {0:?}")]
    ConnectionClosed(Option<u16>),

    /// Operation requires an open connection.
    #[error("Not connected")]
    NotConnected,

    /// `start` was called while a connection attempt is still live.
    #[error("Connection already started")]
    AlreadyStarted,

    /// The request URL cannot be used for a WebSocket connection.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A header value would break the HTTP request framing.
    #[error("Invalid header value for {header}: {reason}")]
    InvalidHeaderValue {
        /// Header name.
        header: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Opcode not usable for the requested operation.
    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// Invalid engine configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidFrame(_)
            | Error::ProtocolViolation(_)
            | Error::InvalidUtf8
            | Error::InvalidPayloadLength(_)
            | Error::FrameTooLarge { .. }
            | Error::MessageTooLarge { .. }
            | Error::TooManyFragments { .. }
            | Error::ReservedOpcode(_)
            | Error::FragmentedControlFrame
            | Error::ControlFrameTooLarge(_)
            | Error::MaskedServerFrame
            | Error::UnmaskedClientFrame
            | Error::ReservedBitsSet => ErrorKind::Protocol,
            Error::Compression(_) | Error::InvalidExtension(_) => ErrorKind::Compression,
            Error::AcceptKeyMismatch { .. }
            | Error::MissingAcceptKey
            | Error::UntrustedCertificate(_) => ErrorKind::Security,
            Error::UnexpectedStatus { .. }
            | Error::InvalidHandshake(_)
            | Error::HandshakeTooLarge { .. } => ErrorKind::Server,
            Error::Io(_) | Error::Tls(_) | Error::Timeout(_) | Error::ConnectionClosed(_) => {
                ErrorKind::Transport
            }
            Error::NotConnected
            | Error::AlreadyStarted
            | Error::InvalidUrl(_)
            | Error::InvalidHeaderValue { .. }
            | Error::InvalidOpcode(_)
            | Error::Config(_) => ErrorKind::Usage,
        }
    }

    /// Close code to send to the peer before tearing down on this error.
    ///
    /// Only errors detected on an open connection carry one.
    #[must_use]
    pub const fn close_code(&self) -> Option<u16> {
        match self {
            Error::InvalidUtf8 => Some(1007),
            Error::FrameTooLarge { .. }
            | Error::MessageTooLarge { .. }
            | Error::TooManyFragments { .. } => Some(1009),
            Error::Compression(_) => Some(1002),
            _ if matches!(self.kind(), ErrorKind::Protocol) => Some(1002),
            _ => None,
        }
    }

    /// Returns `true` for errors that end the connection.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Usage)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Error::InvalidUtf8
    }
}
