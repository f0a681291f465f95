//! # rsws-engine - client-side WebSocket protocol engine
//!
//! `rsws-engine` connects to `ws://` and `wss://` servers, performs the
//! RFC 6455 upgrade, and exchanges frames with optional permessage-deflate
//! compression (RFC 7692).
//!
//! ## Features
//!
//! - **Event driven**: one [`EventListener`] sees every state change and message
//! - **Pluggable transport**: [`TcpTransport`] for real sockets, [`MockTransport`] for tests
//! - **Pluggable trust**: system roots, certificate pinning, or no checks at all
//! - **Resumable frame decoding** that accepts input in arbitrarily small chunks
//! - **Resource limits** on frames, messages, fragments and the handshake
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rsws_engine::{Config, Engine, Request, WebSocketEvent};
//!
//! # async fn run() -> rsws_engine::Result<()> {
//! let engine = Engine::tcp(Config::default());
//! engine.register(|event: WebSocketEvent| println!("{event:?}"));
//! engine.start(Request::new("wss://echo.example.com/")?)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod extensions;
pub mod message;
pub mod protocol;
pub mod request;
pub mod tls;
pub mod transport;

pub use config::{Config, Limits, Timeouts};
pub use connection::{Completion, ConnectionState, Engine, Role};
pub use error::{Error, ErrorKind, Result};
pub use event::{EventListener, WebSocketEvent};
pub use extensions::deflate::DeflateConfig;
pub use message::{CloseCode, CloseFrame};
pub use protocol::{Frame, OpCode, compute_accept_key};
pub use request::{Endpoint, Request};
pub use tls::{AcceptAllTrust, PinnedCertificates, SystemTrust, TrustEvaluator};
pub use transport::{MockHandle, MockTransport, TcpTransport, Transport, TransportEvent};
