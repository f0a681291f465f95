//! Byte transports underneath the protocol engine.
//!
//! A transport moves opaque bytes and reports what happens to the connection
//! through a [`TransportSink`]. It never interprets the data; framing and the
//! upgrade handshake belong to the engine.

mod mock;
mod tcp;

pub use mock::{MockHandle, MockTransport};
pub use tcp::TcpTransport;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::request::Endpoint;
use crate::tls::TrustEvaluator;

/// What a transport reports to its listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The byte stream is established (TCP, plus TLS if requested).
    Connected,
    /// Connecting is waiting on the network.
    Waiting,
    /// The path became usable (`true`) or unusable (`false`).
    Viability(bool),
    /// A better path is available and reconnecting is advised.
    ShouldReconnect(bool),
    /// The connection was torn down by [`Transport::disconnect`].
    Cancelled,
    /// The connection failed.
    Failed(Error),
    /// Bytes read from the peer, in order.
    Receive(Bytes),
    /// The peer closed its side of the stream.
    PeerClosed,
}

/// Non-owning handle back to whoever listens to a transport.
pub type TransportSink = mpsc::UnboundedSender<TransportEvent>;

/// Parameters for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub endpoint: Endpoint,
    /// Consulted during the TLS handshake of `wss` endpoints.
    pub trust: Arc<dyn TrustEvaluator>,
    /// Size of the buffer used for each read.
    pub read_buffer_size: usize,
}

/// A connection-oriented byte stream.
///
/// Events for an attempt go to the sink registered before `connect` was
/// called; registering again only affects later attempts.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Set the listener for subsequent connection attempts.
    fn register(&self, sink: TransportSink);

    /// Start connecting in the background.
    ///
    /// The outcome is reported as `Connected` or `Failed`, followed by
    /// `Receive` events until `PeerClosed`, `Failed` or `Cancelled`. Must be
    /// called from within a tokio runtime.
    fn connect(&self, request: ConnectRequest);

    /// Hand bytes to the stream. Resolves once they are fully written.
    ///
    /// # Errors
    ///
    /// - `Error::NotConnected` when there is no established stream
    /// - `Error::Io` if the write fails
    async fn write(&self, data: Bytes) -> Result<()>;

    /// Tear the connection down. Idempotent and safe in any state.
    ///
    /// A live attempt reports `Cancelled` (or `Failed` if it was already
    /// failing).
    fn disconnect(&self);
}
