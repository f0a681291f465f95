//! The per-connection task that owns all protocol state.
//!
//! Transport events and caller commands arrive on two queues and are handled
//! strictly one at a time, so the decoder, assembler and compression contexts
//! never need locking. Outgoing bytes go through a separate writer task; the
//! connection task never waits on the transport except to flush a final close
//! frame, and even then a force stop still gets through.

use std::sync::{Arc, Mutex, RwLock};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{Instrument, debug, trace, warn};

use crate::config::Config;
use crate::connection::fragmenter::{MessageFragmenter, encode_masked};
use crate::connection::{ConnectionState, Role};
use crate::error::{Error, ErrorKind, Result};
use crate::event::{EventListener, WebSocketEvent};
use crate::extensions::{CompressionHandler, negotiate_response};
use crate::message::{CloseCode, CloseFrame};
use crate::protocol::assembler::MessageAssembler;
use crate::protocol::decoder::FrameDecoder;
use crate::protocol::handshake::{HandshakeRequest, HandshakeResponse, find_header_end};
use crate::protocol::{Frame, OpCode};
use crate::transport::{Transport, TransportEvent, TransportSink};

pub(crate) type ListenerSlot = Arc<RwLock<Option<Arc<dyn EventListener>>>>;
pub(crate) type StateCell = Arc<Mutex<ConnectionState>>;

type Done = oneshot::Sender<Result<()>>;

/// Requests from the [`Engine`](super::Engine) handle.
pub(crate) enum Command {
    Write {
        data: Bytes,
        opcode: OpCode,
        done: Done,
    },
    Stop(u16),
    ForceStop,
}

/// Encoded bytes waiting for the writer task.
struct Outbound {
    data: Bytes,
    done: Option<Done>,
}

pub(crate) struct Session {
    transport: Arc<dyn Transport>,
    listener: ListenerSlot,
    state: StateCell,
    config: Config,
    handshake: HandshakeRequest,
    response: BytesMut,
    decoder: FrameDecoder,
    assembler: MessageAssembler,
    compression: Option<Box<dyn CompressionHandler>>,
    compression_active: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Handed to the writer task when the session starts running.
    pending_queue: Option<mpsc::UnboundedReceiver<Outbound>>,
    /// Code we sent in our close frame, once closing.
    close_code: Option<u16>,
    close_deadline: Option<Instant>,
}

impl Session {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        listener: ListenerSlot,
        state: StateCell,
        config: Config,
        handshake: HandshakeRequest,
        compression: Option<Box<dyn CompressionHandler>>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let decoder = FrameDecoder::new(Role::Client, &config.limits);
        let assembler = MessageAssembler::new(config.limits.clone());
        let (outbound, queue) = mpsc::unbounded_channel();
        Self {
            transport,
            listener,
            state,
            config,
            handshake,
            response: BytesMut::new(),
            decoder,
            assembler,
            compression,
            compression_active: false,
            commands,
            outbound,
            pending_queue: Some(queue),
            close_code: None,
            close_deadline: None,
        }
    }

    /// Drive the connection until it reaches a terminal state.
    ///
    /// `sink` is the sender side of `events`; the writer task reports write
    /// failures through it.
    pub(crate) async fn run(
        mut self,
        sink: TransportSink,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let writer = self.pending_queue.take().map(|queue| {
            tokio::spawn(write_loop(self.transport.clone(), queue, sink).in_current_span())
        });

        while !self.state().is_terminal() {
            let deadline = self.close_deadline;
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!("engine dropped");
                        self.cancel();
                    }
                },
                event = events.recv() => match event {
                    Some(event) => self.on_transport(event).await,
                    None => self.on_transport(TransportEvent::PeerClosed).await,
                },
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    debug!("close handshake timed out");
                    self.transport.disconnect();
                    self.finish_closed(String::new(), self.close_code.unwrap_or(1000));
                }
            }
        }

        // Anything still queued can no longer reach the peer.
        if let Some(writer) = writer {
            writer.abort();
        }
        debug!(state = %self.state(), "connection task finished");
    }

    fn state(&self) -> ConnectionState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let previous = *state;
        debug!(from = %previous, to = %next, "state change");
        *state = next;
    }

    fn emit(&self, event: WebSocketEvent) {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        match listener {
            Some(listener) => listener.on_event(event),
            None => trace!(?event, "no listener registered"),
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Write { data, opcode, done } => self.write(data, opcode, done).await,
            Command::Stop(code) => self.stop(code),
            Command::ForceStop => self.cancel(),
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        let state = self.state();
        if state.is_terminal() {
            trace!(?event, "ignoring transport event after teardown");
            return;
        }

        match event {
            TransportEvent::Connected if state == ConnectionState::Connecting => {
                debug!("transport connected, sending upgrade request");
                self.set_state(ConnectionState::Handshaking);
                self.queue(Bytes::copy_from_slice(self.handshake.as_bytes()), None);
            }
            TransportEvent::Connected => trace!(%state, "ignoring duplicate connected"),
            TransportEvent::Waiting => debug!("transport waiting for connectivity"),
            TransportEvent::Viability(viable) => {
                self.emit(WebSocketEvent::ViabilityChanged(viable));
            }
            TransportEvent::ShouldReconnect(better) => {
                self.emit(WebSocketEvent::ReconnectSuggested(better));
            }
            TransportEvent::Cancelled => match state {
                ConnectionState::Closing => {
                    self.finish_closed(String::new(), self.close_code.unwrap_or(1000));
                }
                _ => {
                    self.set_state(ConnectionState::Cancelled);
                    self.emit(WebSocketEvent::Cancelled);
                }
            },
            TransportEvent::Failed(err) => self.fail(err).await,
            TransportEvent::PeerClosed => match state {
                ConnectionState::Open => {
                    self.transport.disconnect();
                    self.finish_closed(String::new(), CloseCode::Abnormal.as_u16());
                }
                ConnectionState::Closing => {
                    self.finish_closed(String::new(), self.close_code.unwrap_or(1000));
                }
                _ => self.fail(Error::ConnectionClosed(None)).await,
            },
            TransportEvent::Receive(data) => match state {
                ConnectionState::Handshaking => self.on_handshake_data(&data).await,
                ConnectionState::Open | ConnectionState::Closing => self.on_frame_data(&data).await,
                _ => trace!(%state, bytes = data.len(), "ignoring data"),
            },
        }
    }

    async fn on_handshake_data(&mut self, data: &[u8]) {
        self.response.extend_from_slice(data);
        let Some(end) = find_header_end(&self.response) else {
            if let Err(err) = self.config.limits.check_handshake_size(self.response.len()) {
                self.fail(err).await;
            }
            return;
        };
        if let Err(err) = self.config.limits.check_handshake_size(end) {
            self.fail(err).await;
            return;
        }

        let head = self.response.split_to(end);
        let leftover = std::mem::take(&mut self.response);
        if let Err(err) = self.complete_handshake(&head) {
            warn!(error = %err, "upgrade rejected");
            self.fail(err).await;
            return;
        }
        if !leftover.is_empty() {
            self.on_frame_data(&leftover).await;
        }
    }

    fn complete_handshake(&mut self, head: &[u8]) -> Result<()> {
        let response = HandshakeResponse::parse(head)?;
        response.validate(&self.handshake)?;

        self.compression_active =
            negotiate_response(self.compression.as_deref_mut(), response.extensions())?;
        self.decoder.set_compression(self.compression_active);

        debug!(compression = self.compression_active, "websocket open");
        self.set_state(ConnectionState::Open);
        self.emit(WebSocketEvent::Connected(response.headers));
        Ok(())
    }

    async fn on_frame_data(&mut self, data: &[u8]) {
        self.decoder.feed(data);
        while self.state().can_receive() {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(err) = self.on_frame(frame).await {
                        self.fail(err).await;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "invalid frame");
                    self.fail(err).await;
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<()> {
        match frame.opcode {
            OpCode::Ping => {
                let payload = frame.into_payload();
                if self.config.respond_to_ping_with_pong && self.state() == ConnectionState::Open {
                    drop(self.send_control(Frame::pong(payload.clone())));
                }
                self.emit(WebSocketEvent::Ping(non_empty(payload)));
            }
            OpCode::Pong => {
                self.emit(WebSocketEvent::Pong(non_empty(frame.into_payload())));
            }
            OpCode::Close => {
                let close = CloseFrame::parse(frame.payload())?;
                debug!(
                    code = close.code.as_u16(),
                    reason = %close.reason,
                    partial_message = self.assembler.is_assembling(),
                    "close received"
                );
                if self.state() == ConnectionState::Open {
                    let echo = match close.code {
                        CloseCode::NoStatusReceived => CloseCode::Normal.as_u16(),
                        code => code.as_u16(),
                    };
                    let written = self.send_control(Frame::close(Some(echo), ""));
                    self.flush(written).await;
                    if self.state().is_terminal() {
                        return Ok(());
                    }
                }
                self.transport.disconnect();
                self.finish_closed(close.reason, close.code.as_u16());
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                let Some(message) = self.assembler.push(frame)? else {
                    return Ok(());
                };
                let payload = if message.compressed {
                    let max = self.config.limits.max_message_size;
                    self.compression
                        .as_mut()
                        .ok_or(Error::ReservedBitsSet)?
                        .decompress(&message.payload, max)?
                } else {
                    message.payload
                };
                if message.opcode == OpCode::Text {
                    let text = String::from_utf8(payload.to_vec())?;
                    self.emit(WebSocketEvent::Text(text));
                } else {
                    self.emit(WebSocketEvent::Binary(payload));
                }
            }
        }
        Ok(())
    }

    async fn write(&mut self, data: Bytes, opcode: OpCode, done: Done) {
        let encoded = match opcode {
            _ if self.state() != ConnectionState::Open => Err(Error::NotConnected),
            OpCode::Continuation => Err(Error::InvalidOpcode(opcode.as_u8())),
            OpCode::Close => {
                let (code, reason) = match data.as_ref() {
                    [hi, lo, reason @ ..] => (
                        u16::from_be_bytes([*hi, *lo]),
                        String::from_utf8_lossy(reason).into_owned(),
                    ),
                    _ => (CloseCode::Normal.as_u16(), String::new()),
                };
                self.begin_close(code, &reason, Some(done));
                return;
            }
            OpCode::Ping | OpCode::Pong => {
                let frame = Frame::new(true, opcode, data);
                frame
                    .validate()
                    .and_then(|()| encode_masked(std::iter::once(frame)))
            }
            OpCode::Text | OpCode::Binary => self.encode_message(data, opcode),
        };

        match encoded {
            Ok(wire) => self.queue(wire, Some(done)),
            Err(err) => {
                let _ = done.send(Err(err.clone()));
                // A rejected write leaves the connection usable; failing to
                // produce the bytes of a valid one does not.
                if matches!(err.kind(), ErrorKind::Compression | ErrorKind::Transport) {
                    self.fail(err).await;
                }
            }
        }
    }

    fn encode_message(&mut self, data: Bytes, opcode: OpCode) -> Result<Bytes> {
        if opcode == OpCode::Text {
            std::str::from_utf8(&data)?;
        }
        let (payload, compressed) = match self.compression.as_mut() {
            Some(codec) if self.compression_active && !data.is_empty() => {
                (codec.compress(&data)?, true)
            }
            _ => (data, false),
        };
        MessageFragmenter::new(payload, opcode, self.config.fragment_size)
            .compressed(compressed)
            .encode_masked()
    }

    fn stop(&mut self, code: u16) {
        match self.state() {
            ConnectionState::Open => self.begin_close(code, "", None),
            ConnectionState::Connecting | ConnectionState::Handshaking => {
                self.transport.disconnect();
                self.finish_closed(String::new(), code);
            }
            state => trace!(%state, "stop ignored"),
        }
    }

    /// Queue our close frame and start waiting for the peer's.
    fn begin_close(&mut self, code: u16, reason: &str, done: Option<Done>) {
        let frame = if CloseCode::from_u16(code).is_sendable() {
            Frame::close(Some(code), reason)
        } else {
            Frame::close(None, "")
        };
        let wire = match frame
            .validate()
            .and_then(|()| encode_masked(std::iter::once(frame)))
        {
            Ok(wire) => wire,
            Err(err) => {
                debug!(error = %err, "close frame rejected");
                if let Some(done) = done {
                    let _ = done.send(Err(err));
                }
                return;
            }
        };

        debug!(code, "closing");
        self.close_code = Some(code);
        self.close_deadline = Some(Instant::now() + self.config.timeouts.close);
        self.set_state(ConnectionState::Closing);
        self.queue(wire, done);
    }

    /// Hand encoded bytes to the writer task, behind everything queued before.
    fn queue(&self, data: Bytes, done: Option<Done>) {
        trace!(bytes = data.len(), "queueing");
        // Fails only once the writer is gone; the dropped `done` then reads
        // as not connected.
        let _ = self.outbound.send(Outbound { data, done });
    }

    /// Queue one control frame. The receiver resolves once it was written.
    fn send_control(&self, frame: Frame) -> oneshot::Receiver<Result<()>> {
        let (done, written) = oneshot::channel();
        match encode_masked(std::iter::once(frame)) {
            Ok(wire) => self.queue(wire, Some(done)),
            Err(err) => {
                let _ = done.send(Err(err));
            }
        }
        written
    }

    /// Wait for a final frame to be written, bounded by the close timeout.
    ///
    /// Commands are still served meanwhile: a force stop (or the engine going
    /// away) cancels the connection, other requests are refused.
    async fn flush(&mut self, mut written: oneshot::Receiver<Result<()>>) {
        let timeout = tokio::time::sleep(self.config.timeouts.close);
        tokio::pin!(timeout);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::ForceStop) | None => {
                        self.cancel();
                        return;
                    }
                    Some(Command::Write { done, .. }) => {
                        let _ = done.send(Err(Error::NotConnected));
                    }
                    Some(Command::Stop(code)) => trace!(code, "stop ignored while flushing"),
                },
                result = &mut written => {
                    if let Ok(Err(err)) = result {
                        debug!(error = %err, "final frame not written");
                    }
                    return;
                }
                () = &mut timeout => {
                    debug!("final frame still pending at close timeout");
                    return;
                }
            }
        }
    }

    fn cancel(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        self.transport.disconnect();
        self.set_state(ConnectionState::Cancelled);
        self.emit(WebSocketEvent::Cancelled);
    }

    fn finish_closed(&mut self, reason: String, code: u16) {
        self.close_deadline = None;
        self.set_state(ConnectionState::Closed);
        self.emit(WebSocketEvent::Disconnected { reason, code });
    }

    /// Report `err` as the end of the connection.
    async fn fail(&mut self, err: Error) {
        let state = self.state();
        if state.is_terminal() {
            return;
        }
        warn!(error = %err, kind = %err.kind(), "connection failed");

        if state == ConnectionState::Open {
            if let Some(code) = err.close_code() {
                let written = self.send_control(Frame::close(Some(code), ""));
                self.flush(written).await;
                if self.state().is_terminal() {
                    return;
                }
            }
        }
        self.set_state(ConnectionState::Failed);
        self.emit(WebSocketEvent::Error(err));
        self.transport.disconnect();
    }
}

/// Hand queued bytes to the transport in order.
///
/// Runs beside the connection task, so a stalled write holds up only the
/// writes queued behind it. Fatal write errors go back to the connection task
/// as a transport failure.
async fn write_loop(
    transport: Arc<dyn Transport>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    sink: TransportSink,
) {
    while let Some(Outbound { data, done }) = queue.recv().await {
        let len = data.len();
        let result = transport.write(data).await;
        match &result {
            Ok(()) => trace!(bytes = len, "sent"),
            Err(err) if err.is_fatal() => {
                debug!(error = %err, bytes = len, "write failed");
                let _ = sink.send(TransportEvent::Failed(err.clone()));
            }
            Err(err) => trace!(error = %err, "write refused"),
        }
        if let Some(done) = done {
            let _ = done.send(result);
        }
    }
}

fn non_empty(payload: Bytes) -> Option<Bytes> {
    (!payload.is_empty()).then_some(payload)
}
