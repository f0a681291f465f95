//! Engine lifecycle states.

/// Lifecycle of one connection attempt.
///
/// ```text
/// Idle -> Connecting -> Handshaking -> Open -> Closing -> Closed
///              \             \           \         \
///               +-------------+-----------+---------+--> Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not started yet.
    #[default]
    Idle,
    /// Waiting for the transport to connect.
    Connecting,
    /// Upgrade request sent, waiting for the 101 response.
    Handshaking,
    /// WebSocket established.
    Open,
    /// Close frame sent or received, waiting for the transport to go away.
    Closing,
    /// Closed after a close handshake or peer shutdown.
    Closed,
    /// Ended by an error.
    Failed,
    /// Ended by cancellation.
    Cancelled,
}

impl ConnectionState {
    /// `Closed`, `Failed` and `Cancelled` end the attempt.
    #[must_use]
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Closed | ConnectionState::Failed | ConnectionState::Cancelled
        )
    }

    /// Check if application writes are accepted in this state.
    #[must_use]
    #[inline]
    pub const fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Check if inbound frames are still processed in this state.
    #[must_use]
    #[inline]
    pub const fn can_receive(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::Closing)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
            ConnectionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
