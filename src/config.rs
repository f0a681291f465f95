//! Configuration and limits for WebSocket client connections.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::extensions::deflate::DeflateConfig;
use crate::tls::TrustEvaluator;

/// Resource limits applied to everything the server sends.
///
/// These bound memory use against a misbehaving or hostile peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum payload of a single frame in bytes.
    ///
    /// Default: 16 MB
    pub max_frame_size: usize,

    /// Maximum size of a reassembled (and inflated) message in bytes.
    ///
    /// Default: 64 MB
    pub max_message_size: usize,

    /// Maximum number of frames in one fragmented message.
    ///
    /// Default: 128
    pub max_fragment_count: usize,

    /// Maximum size of the HTTP upgrade response in bytes.
    ///
    /// Default: 8 KB
    pub max_handshake_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,   // 16 MB
            max_message_size: 64 * 1024 * 1024, // 64 MB
            max_fragment_count: 128,
            max_handshake_size: 8192,
        }
    }
}

impl Limits {
    #[must_use]
    pub const fn new(
        max_frame_size: usize,
        max_message_size: usize,
        max_fragment_count: usize,
        max_handshake_size: usize,
    ) -> Self {
        Self {
            max_frame_size,
            max_message_size,
            max_fragment_count,
            max_handshake_size,
        }
    }

    /// Limits suitable for small embedded systems.
    ///
    /// - Max frame: 64 KB
    /// - Max message: 256 KB
    /// - Max fragments: 16
    /// - Max handshake: 4 KB
    #[must_use]
    pub const fn embedded() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            max_message_size: 256 * 1024,
            max_fragment_count: 16,
            max_handshake_size: 4096,
        }
    }

    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    #[must_use]
    pub const fn with_max_fragment_count(mut self, count: usize) -> Self {
        self.max_fragment_count = count;
        self
    }

    #[must_use]
    pub const fn with_max_handshake_size(mut self, size: usize) -> Self {
        self.max_handshake_size = size;
        self
    }

    /// Validate that message size is within limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`] if `size` exceeds the configured maximum.
    pub const fn check_message_size(&self, size: usize) -> Result<()> {
        if size > self.max_message_size {
            Err(Error::MessageTooLarge {
                size,
                max: self.max_message_size,
            })
        } else {
            Ok(())
        }
    }

    /// Validate that fragment count is within limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyFragments`] if `count` exceeds the configured maximum.
    pub const fn check_fragment_count(&self, count: usize) -> Result<()> {
        if count > self.max_fragment_count {
            Err(Error::TooManyFragments {
                count,
                max: self.max_fragment_count,
            })
        } else {
            Ok(())
        }
    }

    /// Validate that the buffered handshake response is within limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandshakeTooLarge`] if `size` exceeds the configured maximum.
    pub const fn check_handshake_size(&self, size: usize) -> Result<()> {
        if size > self.max_handshake_size {
            Err(Error::HandshakeTooLarge {
                size,
                max: self.max_handshake_size,
            })
        } else {
            Ok(())
        }
    }
}

/// Timeouts enforced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Upper bound for TCP connect plus TLS handshake.
    ///
    /// A [`Request`](crate::Request) can override this per attempt.
    /// Default: 10 seconds
    pub connect: Duration,

    /// How long `stop` waits for the server's close frame before the
    /// transport is torn down anyway.
    ///
    /// Default: 5 seconds
    pub close: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            close: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    #[must_use]
    pub const fn new(connect: Duration, close: Duration) -> Self {
        Self { connect, close }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Resource limits.
    pub limits: Limits,

    /// Connect and close timeouts.
    pub timeouts: Timeouts,

    /// Split outgoing data messages into frames of at most this many bytes.
    ///
    /// `None` sends every message as a single frame.
    /// Default: None
    pub fragment_size: Option<usize>,

    /// Size of the buffer handed to each transport read.
    ///
    /// Default: 4096
    pub read_buffer_size: usize,

    /// Answer inbound pings automatically.
    ///
    /// The ping is surfaced as an event either way.
    /// Default: true
    pub respond_to_ping_with_pong: bool,

    /// permessage-deflate parameters to offer, or `None` to not offer it.
    ///
    /// Ignored when the crate is built without the `compression` feature.
    /// Default: None
    pub compression: Option<DeflateConfig>,

    /// TLS trust policy for `wss` endpoints.
    ///
    /// `None` means [`SystemTrust`](crate::tls::SystemTrust).
    /// Default: None
    pub trust: Option<Arc<dyn TrustEvaluator>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            timeouts: Timeouts::default(),
            fragment_size: None,
            read_buffer_size: 4096,
            respond_to_ping_with_pong: true,
            compression: None,
            trust: None,
        }
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_respond_to_ping(mut self, respond: bool) -> Self {
        self.respond_to_ping_with_pong = respond;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, deflate: DeflateConfig) -> Self {
        self.compression = Some(deflate);
        self
    }

    #[must_use]
    pub fn with_trust(mut self, trust: Arc<dyn TrustEvaluator>) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Check the configuration for values the engine cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero read buffer, a zero fragment size,
    /// or limits of zero.
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(Error::Config("read_buffer_size must be non-zero".into()));
        }
        if self.fragment_size == Some(0) {
            return Err(Error::Config("fragment_size must be non-zero".into()));
        }
        if self.limits.max_message_size == 0 || self.limits.max_fragment_count == 0 {
            return Err(Error::Config("message limits must be non-zero".into()));
        }
        if self.limits.max_handshake_size == 0 {
            return Err(Error::Config("max_handshake_size must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::AcceptAllTrust;

    #[test]
    fn test_default_limits() {
        let limits = Limits::default();
        assert_eq!(limits.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(limits.max_message_size, 64 * 1024 * 1024);
        assert_eq!(limits.max_fragment_count, 128);
        assert_eq!(limits.max_handshake_size, 8192);
    }

    #[test]
    fn test_embedded_limits_are_smaller() {
        let embedded = Limits::embedded();
        let default = Limits::default();
        assert!(embedded.max_frame_size < default.max_frame_size);
        assert!(embedded.max_message_size < default.max_message_size);
    }

    #[test]
    fn test_limits_builders() {
        let limits = Limits::default()
            .with_max_frame_size(10)
            .with_max_message_size(20)
            .with_max_fragment_count(3)
            .with_max_handshake_size(40);
        assert_eq!(limits, Limits::new(10, 20, 3, 40));
    }

    #[test]
    fn test_check_message_size() {
        let limits = Limits::new(100, 1000, 10, 500);
        assert!(limits.check_message_size(1000).is_ok());
        assert_eq!(
            limits.check_message_size(1001),
            Err(Error::MessageTooLarge {
                size: 1001,
                max: 1000
            })
        );
    }

    #[test]
    fn test_check_fragment_count() {
        let limits = Limits::new(100, 1000, 10, 500);
        assert!(limits.check_fragment_count(10).is_ok());
        assert!(matches!(
            limits.check_fragment_count(11),
            Err(Error::TooManyFragments { count: 11, max: 10 })
        ));
    }

    #[test]
    fn test_check_handshake_size() {
        let limits = Limits::new(100, 1000, 10, 500);
        assert!(limits.check_handshake_size(500).is_ok());
        assert!(matches!(
            limits.check_handshake_size(501),
            Err(Error::HandshakeTooLarge { .. })
        ));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.read_buffer_size, 4096);
        assert!(config.respond_to_ping_with_pong);
        assert!(config.fragment_size.is_none());
        assert!(config.compression.is_none());
        assert!(config.trust.is_none());
        assert_eq!(config.timeouts.connect, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_chain() {
        let config = Config::new()
            .with_fragment_size(1024)
            .with_read_buffer_size(512)
            .with_respond_to_ping(false)
            .with_compression(DeflateConfig::default())
            .with_trust(Arc::new(AcceptAllTrust))
            .with_timeouts(Timeouts::new(Duration::from_secs(1), Duration::from_secs(2)));

        assert_eq!(config.fragment_size, Some(1024));
        assert_eq!(config.read_buffer_size, 512);
        assert!(!config.respond_to_ping_with_pong);
        assert!(config.compression.is_some());
        assert!(config.trust.is_some());
        assert_eq!(config.timeouts.close, Duration::from_secs(2));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(matches!(
            Config::new().with_read_buffer_size(0).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::new().with_fragment_size(0).validate(),
            Err(Error::Config(_))
        ));
    }
}
