use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tracing::{Instrument, debug, trace};

use super::{ConnectRequest, Transport, TransportEvent, TransportSink};
use crate::error::{Error, Result};
use crate::tls::{self, MaybeTlsStream};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// State of one connection attempt.
struct Attempt {
    writer: tokio::sync::Mutex<Option<WriteHalf<MaybeTlsStream>>>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
    /// Flips to `true` on teardown; a write in flight gives up its lock.
    closed: watch::Sender<bool>,
}

impl Attempt {
    fn new(cancel: oneshot::Sender<()>) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(None),
            cancel: Mutex::new(Some(cancel)),
            closed: watch::Sender::new(false),
        }
    }

    async fn close_writer(&self) {
        self.closed.send_replace(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
        }
    }
}

async fn write_flushed(
    writer: &mut WriteHalf<MaybeTlsStream>,
    data: &[u8],
) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

#[derive(Default)]
struct Shared {
    sink: Mutex<Option<TransportSink>>,
    attempt: Mutex<Option<Arc<Attempt>>>,
}

/// TCP transport with optional TLS via rustls.
///
/// One attempt is live at a time; connecting again cancels the previous one.
#[derive(Clone, Default)]
pub struct TcpTransport {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("connected", &lock(&self.shared.attempt).is_some())
            .finish()
    }
}

impl TcpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn register(&self, sink: TransportSink) {
        *lock(&self.shared.sink) = Some(sink);
    }

    fn connect(&self, request: ConnectRequest) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let attempt = Arc::new(Attempt::new(cancel_tx));

        if let Some(previous) = lock(&self.shared.attempt).replace(attempt.clone()) {
            if let Some(cancel) = lock(&previous.cancel).take() {
                let _ = cancel.send(());
            }
        }

        let Some(sink) = lock(&self.shared.sink).clone() else {
            debug!("connect called without a registered listener");
            return;
        };

        let span = tracing::debug_span!(
            "tcp_transport",
            host = %request.endpoint.host,
            port = request.endpoint.port,
            tls = request.endpoint.tls
        );
        tokio::spawn(run(attempt, request, sink, cancel_rx).instrument(span));
    }

    async fn write(&self, data: Bytes) -> Result<()> {
        let attempt = lock(&self.shared.attempt).clone().ok_or(Error::NotConnected)?;
        let mut closed = attempt.closed.subscribe();
        let mut guard = attempt.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;
        tokio::select! {
            result = write_flushed(writer, &data) => result?,
            _ = closed.wait_for(|closed| *closed) => {
                debug!(bytes = data.len(), "write abandoned on teardown");
                return Err(Error::NotConnected);
            }
        }
        trace!(bytes = data.len(), "wrote");
        Ok(())
    }

    fn disconnect(&self) {
        let attempt = lock(&self.shared.attempt).clone();
        match attempt {
            Some(attempt) => {
                if let Some(cancel) = lock(&attempt.cancel).take() {
                    debug!("disconnect requested");
                    let _ = cancel.send(());
                }
            }
            None => {
                if let Some(sink) = lock(&self.shared.sink).as_ref() {
                    let _ = sink.send(TransportEvent::Cancelled);
                }
            }
        }
    }
}

async fn establish(request: &ConnectRequest) -> Result<MaybeTlsStream> {
    let endpoint = &request.endpoint;
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    tcp.set_nodelay(true)?;
    if !endpoint.tls {
        return Ok(MaybeTlsStream::Plain(tcp));
    }
    let config = tls::client_config(request.trust.clone())?;
    let stream = tls::connect(config, &endpoint.host, tcp).await?;
    Ok(MaybeTlsStream::Tls(Box::new(stream)))
}

async fn run(
    attempt: Arc<Attempt>,
    request: ConnectRequest,
    sink: TransportSink,
    mut cancel: oneshot::Receiver<()>,
) {
    let timeout = request.endpoint.timeout;
    debug!(?timeout, "connecting");

    let stream = tokio::select! {
        biased;
        _ = &mut cancel => {
            let _ = sink.send(TransportEvent::Cancelled);
            return;
        }
        result = tokio::time::timeout(timeout, establish(&request)) => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(error = %err, "connect failed");
                let _ = sink.send(TransportEvent::Failed(err));
                return;
            }
            Err(_) => {
                debug!("connect timed out");
                let _ = sink.send(TransportEvent::Failed(Error::Timeout(timeout)));
                return;
            }
        }
    };

    let (mut reader, writer) = tokio::io::split(stream);
    *attempt.writer.lock().await = Some(writer);
    debug!("connected");
    let _ = sink.send(TransportEvent::Connected);

    let mut buf = vec![0u8; request.read_buffer_size.max(1)];
    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => {
                attempt.close_writer().await;
                debug!("cancelled");
                let _ = sink.send(TransportEvent::Cancelled);
                return;
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    attempt.close_writer().await;
                    debug!("peer closed the stream");
                    let _ = sink.send(TransportEvent::PeerClosed);
                    return;
                }
                Ok(n) => {
                    trace!(bytes = n, "read");
                    let _ = sink.send(TransportEvent::Receive(Bytes::copy_from_slice(&buf[..n])));
                }
                Err(err) => {
                    attempt.close_writer().await;
                    debug!(error = %err, "read failed");
                    let _ = sink.send(TransportEvent::Failed(err.into()));
                    return;
                }
            }
        }
    }
}
