//! The public handle that starts, drives and stops one connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, warn};

use super::ConnectionState;
use super::session::{Command, ListenerSlot, Session, StateCell};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{EventListener, WebSocketEvent};
use crate::extensions::CompressionHandler;
use crate::protocol::OpCode;
use crate::protocol::handshake::HandshakeRequest;
use crate::request::Request;
use crate::tls::{AcceptAllTrust, SystemTrust, TrustEvaluator};
use crate::transport::{ConnectRequest, TcpTransport, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Client WebSocket engine.
///
/// The engine owns a [`Transport`] and runs each connection as a task on the
/// current tokio runtime. Everything that happens is reported to the
/// registered [`EventListener`]; writes report their own outcome through the
/// returned [`Completion`].
///
/// ```rust,no_run
/// use rsws_engine::{Config, Engine, Request, WebSocketEvent};
///
/// # async fn run() -> rsws_engine::Result<()> {
/// let engine = Engine::tcp(Config::default());
/// let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
/// engine.register(tx);
/// engine.start(Request::new("ws://localhost:9001/")?)?;
///
/// while let Some(event) = events.recv().await {
///     match event {
///         WebSocketEvent::Connected(_) => {
///             engine.write_string("hello").await?;
///         }
///         WebSocketEvent::Text(text) => {
///             println!("{text}");
///             engine.stop(1000);
///         }
///         event if event.is_terminal() => break,
///         _ => {}
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    transport: Arc<dyn Transport>,
    config: Config,
    listener: ListenerSlot,
    state: StateCell,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn new(transport: impl Transport, config: Config) -> Self {
        Self::with_transport(Arc::new(transport), config)
    }

    #[must_use]
    pub fn with_transport(transport: Arc<dyn Transport>, config: Config) -> Self {
        Self {
            transport,
            config,
            listener: Arc::new(RwLock::new(None)),
            state: Arc::new(Mutex::new(ConnectionState::Idle)),
            commands: Mutex::new(None),
        }
    }

    /// An engine over a [`TcpTransport`].
    #[must_use]
    pub fn tcp(config: Config) -> Self {
        Self::new(TcpTransport::new(), config)
    }

    /// Replace the event listener. Events of a running connection go to the
    /// new listener from the next event on.
    pub fn register(&self, listener: impl EventListener) {
        *self
            .listener
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::new(listener));
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Begin connecting to `request`.
    ///
    /// Must be called from within a tokio runtime. Failures detected before
    /// the transport is involved are returned and also reported as an
    /// [`WebSocketEvent::Error`].
    ///
    /// # Errors
    ///
    /// - `Error::AlreadyStarted` while a previous attempt has not finished
    /// - `Error::Config` for an invalid configuration or a missing runtime
    /// - `Error::InvalidUrl` or `Error::InvalidHeaderValue` for a bad request
    pub fn start(&self, request: Request) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if !state.is_terminal() && *state != ConnectionState::Idle {
                return Err(Error::AlreadyStarted);
            }
            *state = ConnectionState::Connecting;
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        match self.prepare(&request, commands_rx) {
            Ok((session, connect)) => {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                *lock(&self.commands) = Some(commands_tx);

                let span = tracing::info_span!(
                    "ws_connection",
                    host = %connect.endpoint.host,
                    port = connect.endpoint.port
                );
                debug!(parent: &span, resource = %connect.endpoint.resource, "starting");
                tokio::spawn(session.run(events_tx.clone(), events_rx).instrument(span));

                self.transport.register(events_tx);
                self.transport.connect(connect);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "connection not started");
                *lock(&self.state) = ConnectionState::Failed;
                self.emit(WebSocketEvent::Error(err.clone()));
                Err(err)
            }
        }
    }

    fn prepare(
        &self,
        request: &Request,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Result<(Session, ConnectRequest)> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::Config("start requires a tokio runtime".into()));
        }
        self.config.validate()?;
        let endpoint = request.endpoint(self.config.timeouts.connect)?;

        let compression = self.compression_handler();
        let offer = compression.as_ref().map(|handler| handler.offer().to_string());
        let handshake = HandshakeRequest::new(request, &endpoint, offer.as_deref())?;

        let trust: Arc<dyn TrustEvaluator> = match &self.config.trust {
            Some(trust) => trust.clone(),
            None if endpoint.tls => Arc::new(SystemTrust::new()?),
            // Never consulted for plain connections.
            None => Arc::new(AcceptAllTrust),
        };

        let session = Session::new(
            self.transport.clone(),
            self.listener.clone(),
            self.state.clone(),
            self.config.clone(),
            handshake,
            compression,
            commands,
        );
        let connect = ConnectRequest {
            endpoint,
            trust,
            read_buffer_size: self.config.read_buffer_size,
        };
        Ok((session, connect))
    }

    #[cfg(feature = "compression")]
    fn compression_handler(&self) -> Option<Box<dyn CompressionHandler>> {
        use crate::extensions::deflate::PerMessageDeflate;

        self.config
            .compression
            .clone()
            .map(|deflate| Box::new(PerMessageDeflate::new(deflate)) as Box<dyn CompressionHandler>)
    }

    #[cfg(not(feature = "compression"))]
    fn compression_handler(&self) -> Option<Box<dyn CompressionHandler>> {
        if self.config.compression.is_some() {
            debug!("compression requested but not compiled in");
        }
        None
    }

    fn emit(&self, event: WebSocketEvent) {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener.on_event(event);
        }
    }

    fn send(&self, command: Command) -> std::result::Result<(), Command> {
        match lock(&self.commands).as_ref() {
            Some(commands) => commands.send(command).map_err(|err| err.0),
            None => Err(command),
        }
    }

    /// Close gracefully with `code`.
    ///
    /// An open connection sends a close frame and waits for the server's
    /// reply, bounded by the close timeout. An attempt that is not open yet
    /// is torn down and reported as disconnected with `code`.
    pub fn stop(&self, code: u16) {
        if self.send(Command::Stop(code)).is_err() {
            debug!(code, "stop without a running connection");
        }
    }

    /// Tear the connection down immediately and report [`WebSocketEvent::Cancelled`].
    pub fn force_stop(&self) {
        if self.send(Command::ForceStop).is_err() {
            debug!("force_stop without a running connection");
        }
    }

    /// Queue a frame of type `opcode`.
    ///
    /// Text and binary payloads may be compressed and fragmented. A close
    /// payload is a big-endian code optionally followed by a reason, and
    /// starts the close handshake.
    pub fn write(&self, data: impl Into<Bytes>, opcode: OpCode) -> Completion {
        let (done, rx) = oneshot::channel();
        let command = Command::Write {
            data: data.into(),
            opcode,
            done,
        };
        match self.send(command) {
            Ok(()) => Completion::Pending(rx),
            Err(_) => Completion::Ready(Some(Err(Error::NotConnected))),
        }
    }

    pub fn write_string(&self, text: impl Into<String>) -> Completion {
        self.write(Bytes::from(text.into()), OpCode::Text)
    }

    pub fn write_binary(&self, data: impl Into<Bytes>) -> Completion {
        self.write(data, OpCode::Binary)
    }

    pub fn write_ping(&self, data: impl Into<Bytes>) -> Completion {
        self.write(data, OpCode::Ping)
    }

    pub fn write_pong(&self, data: impl Into<Bytes>) -> Completion {
        self.write(data, OpCode::Pong)
    }
}

/// Resolves once the transport has taken a write, or the write has failed.
///
/// Dropping it does not cancel the write. A write still queued when the
/// connection ends resolves to `Error::NotConnected`.
#[derive(Debug)]
#[must_use = "a write's outcome is only observable through its Completion"]
pub enum Completion {
    #[doc(hidden)]
    Ready(Option<Result<()>>),
    #[doc(hidden)]
    Pending(oneshot::Receiver<Result<()>>),
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            Completion::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(Error::NotConnected)))
            }
            Completion::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // The connection task ended before reaching this write.
                Poll::Ready(Err(_)) => Poll::Ready(Err(Error::NotConnected)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[tokio::test]
    async fn test_write_before_start_is_not_connected() {
        let (transport, _handle) = MockTransport::new();
        let engine = Engine::new(transport, Config::default());
        assert_eq!(engine.write_string("hi").await, Err(Error::NotConnected));
        assert_eq!(engine.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_bad_url_fails_start_and_reports() {
        let (transport, _handle) = MockTransport::new();
        let engine = Engine::new(transport, Config::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.register(tx);

        let request = Request::new("ws://example.com/")
            .unwrap()
            .with_header("Upgrade", "h2c");
        let err = engine.start(request).unwrap_err();
        assert!(matches!(err, Error::InvalidHeaderValue { .. }));
        assert_eq!(rx.recv().await, Some(WebSocketEvent::Error(err)));
        assert_eq!(engine.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (transport, _handle) = MockTransport::with_options(false, true);
        let engine = Engine::new(transport, Config::default());
        engine.start(Request::new("ws://example.com/").unwrap()).unwrap();
        assert_eq!(
            engine.start(Request::new("ws://example.com/").unwrap()),
            Err(Error::AlreadyStarted)
        );
    }

    #[test]
    fn test_start_outside_runtime() {
        let (transport, _handle) = MockTransport::new();
        let engine = Engine::new(transport, Config::default());
        let err = engine
            .start(Request::new("ws://example.com/").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
