//! Events the engine reports to its listener.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Error;

/// Everything observable about a connection, in the order it happened.
///
/// A connection attempt ends with exactly one of `Disconnected`, `Error` or
/// `Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketEvent {
    /// The upgrade succeeded. Header names are lowercase.
    Connected(HashMap<String, String>),
    /// The connection closed. `code` is the peer's close code, 1005 when it
    /// sent none, or 1006 when the stream ended without a close frame.
    Disconnected { reason: String, code: u16 },
    Text(String),
    Binary(Bytes),
    /// `None` for an empty payload.
    Ping(Option<Bytes>),
    /// `None` for an empty payload.
    Pong(Option<Bytes>),
    /// The connection failed.
    Error(Error),
    ViabilityChanged(bool),
    ReconnectSuggested(bool),
    /// Torn down by `force_stop` or a transport cancel.
    Cancelled,
}

impl WebSocketEvent {
    /// Whether this event ends the connection attempt.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WebSocketEvent::Disconnected { .. }
                | WebSocketEvent::Error(_)
                | WebSocketEvent::Cancelled
        )
    }
}

/// Receives [`WebSocketEvent`]s.
///
/// Called from the connection task, one event at a time and in order, so an
/// implementation must not block for long.
pub trait EventListener: Send + Sync + 'static {
    fn on_event(&self, event: WebSocketEvent);
}

impl<F> EventListener for F
where
    F: Fn(WebSocketEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: WebSocketEvent) {
        self(event);
    }
}

impl EventListener for mpsc::UnboundedSender<WebSocketEvent> {
    fn on_event(&self, event: WebSocketEvent) {
        // The receiver going away only means nobody is interested any more.
        let _ = self.send(event);
    }
}
