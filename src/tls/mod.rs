//! TLS for `wss://` endpoints.
//!
//! rustls performs the handshake; whether the server's certificate is
//! acceptable is decided by a [`TrustEvaluator`]. Three policies ship with
//! the crate:
//!
//! - [`SystemTrust`]: WebPKI validation against the bundled Mozilla roots
//! - [`AcceptAllTrust`]: no validation at all
//! - [`PinnedCertificates`]: accept only chains containing a known certificate

mod trust;
mod verifier;

pub use trust::{AcceptAllTrust, PinnedCertificates, SystemTrust, TrustEvaluator};

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::ClientConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use verifier::TrustVerifier;

/// The process-wide rustls provider if one is installed, otherwise aws-lc-rs.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Client configuration whose certificate decisions go to `trust`.
///
/// # Errors
///
/// Returns [`Error::Tls`] if the crypto provider supports no safe protocol version.
pub fn client_config(trust: Arc<dyn TrustEvaluator>) -> Result<Arc<ClientConfig>> {
    let provider = crypto_provider();
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustVerifier::new(trust, provider)))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Run the TLS handshake over an established TCP stream.
///
/// # Errors
///
/// - `Error::UntrustedCertificate` if the trust evaluator rejected the chain
/// - `Error::Tls` for an invalid server name or any other handshake failure
pub async fn connect(
    config: Arc<ClientConfig>,
    host: &str,
    stream: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::Tls(format!("invalid server name {host}")))?;
    tokio_rustls::TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(handshake_error)
}

/// Recover the engine error behind a failed handshake.
fn handshake_error(err: io::Error) -> Error {
    let Some(tls_err) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    else {
        return Error::from(err);
    };
    match tls_err {
        rustls::Error::InvalidCertificate(rustls::CertificateError::Other(other)) => other
            .0
            .downcast_ref::<Error>()
            .cloned()
            .unwrap_or_else(|| Error::UntrustedCertificate(other.to_string())),
        rustls::Error::InvalidCertificate(cert_err) => {
            Error::UntrustedCertificate(cert_err.to_string())
        }
        other => Error::Tls(other.to_string()),
    }
}

/// A TCP stream, optionally wrapped in TLS.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for MaybeTlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaybeTlsStream::Plain(_) => f.write_str("MaybeTlsStream::Plain"),
            MaybeTlsStream::Tls(_) => f.write_str("MaybeTlsStream::Tls"),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
