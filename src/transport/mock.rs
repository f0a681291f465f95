use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{ConnectRequest, Transport, TransportEvent, TransportSink};
use crate::error::{Error, Result};
use crate::request::Endpoint;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct MockShared {
    sink: Mutex<Option<TransportSink>>,
    endpoints: Mutex<Vec<Endpoint>>,
    connected: AtomicBool,
    disconnects: AtomicUsize,
    write_error: Mutex<Option<Error>>,
    stall_writes: AtomicBool,
    writes: mpsc::UnboundedSender<Bytes>,
    auto_connect: bool,
    cancel_on_disconnect: bool,
}

impl MockShared {
    fn emit(&self, event: TransportEvent) -> bool {
        lock(&self.sink)
            .as_ref()
            .is_some_and(|sink| sink.send(event).is_ok())
    }
}

/// In-memory transport for driving the engine in tests.
///
/// Everything written is forwarded to the paired [`MockHandle`], which also
/// injects the events a real transport would produce.
pub struct MockTransport {
    shared: Arc<MockShared>,
}

/// Test side of a [`MockTransport`].
pub struct MockHandle {
    shared: Arc<MockShared>,
    writes: mpsc::UnboundedReceiver<Bytes>,
}

impl MockTransport {
    /// A transport that reports `Connected` as soon as `connect` is called and
    /// `Cancelled` on `disconnect`.
    #[must_use]
    pub fn new() -> (Self, MockHandle) {
        Self::with_options(true, true)
    }

    /// `auto_connect` reports `Connected` from `connect`; otherwise the test
    /// decides. `cancel_on_disconnect` reports `Cancelled` from `disconnect`.
    #[must_use]
    pub fn with_options(auto_connect: bool, cancel_on_disconnect: bool) -> (Self, MockHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            sink: Mutex::new(None),
            endpoints: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
            write_error: Mutex::new(None),
            stall_writes: AtomicBool::new(false),
            writes: tx,
            auto_connect,
            cancel_on_disconnect,
        });
        (
            Self {
                shared: shared.clone(),
            },
            MockHandle { shared, writes: rx },
        )
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    fn register(&self, sink: TransportSink) {
        *lock(&self.shared.sink) = Some(sink);
    }

    fn connect(&self, request: ConnectRequest) {
        lock(&self.shared.endpoints).push(request.endpoint);
        if self.shared.auto_connect {
            self.shared.connected.store(true, Ordering::SeqCst);
            self.shared.emit(TransportEvent::Connected);
        }
    }

    async fn write(&self, data: Bytes) -> Result<()> {
        if self.shared.stall_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(err) = lock(&self.shared.write_error).clone() {
            return Err(err);
        }
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let _ = self.shared.writes.send(data);
        Ok(())
    }

    fn disconnect(&self) {
        self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.shared.connected.swap(false, Ordering::SeqCst) && self.shared.cancel_on_disconnect
        {
            self.shared.emit(TransportEvent::Cancelled);
        }
    }
}

impl MockHandle {
    /// Deliver an event to the registered listener.
    ///
    /// Returns `false` if nobody is listening any more.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match &event {
            TransportEvent::Connected => self.shared.connected.store(true, Ordering::SeqCst),
            TransportEvent::Cancelled | TransportEvent::Failed(_) | TransportEvent::PeerClosed => {
                self.shared.connected.store(false, Ordering::SeqCst);
            }
            _ => {}
        }
        self.shared.emit(event)
    }

    /// Deliver bytes as if read from the peer.
    pub fn receive(&self, data: impl Into<Bytes>) -> bool {
        self.emit(TransportEvent::Receive(data.into()))
    }

    /// Next chunk written by the engine, waiting for it if necessary.
    pub async fn next_write(&mut self) -> Option<Bytes> {
        self.writes.recv().await
    }

    /// A chunk already written, without waiting.
    pub fn try_next_write(&mut self) -> Option<Bytes> {
        self.writes.try_recv().ok()
    }

    /// Make every subsequent write fail with `err`, or succeed again with `None`.
    pub fn set_write_error(&self, err: Option<Error>) {
        *lock(&self.shared.write_error) = err;
    }

    /// Make subsequent writes never complete, like a peer that stopped
    /// reading.
    pub fn stall_writes(&self, stall: bool) {
        self.shared.stall_writes.store(stall, Ordering::SeqCst);
    }

    /// Endpoints passed to `connect`, in order.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        lock(&self.shared.endpoints).clone()
    }

    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.shared.disconnects.load(Ordering::SeqCst)
    }
}
