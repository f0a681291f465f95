//! Certificate trust policies for `wss` connections.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

use crate::error::{Error, Result};

/// Decides whether a server's certificate chain is acceptable.
///
/// Called once per TLS handshake with the chain as presented (end entity
/// first) and the host name being connected to. Returning an error aborts
/// the handshake; the engine reports it as a security error.
pub trait TrustEvaluator: fmt::Debug + Send + Sync {
    /// # Errors
    ///
    /// Returns [`Error::UntrustedCertificate`] to reject the chain.
    fn evaluate_trust(&self, chain: &[CertificateDer<'_>], domain: &str) -> Result<()>;
}

/// Platform-style validation: path building to a trusted root plus host name
/// checks, using the Mozilla root program unless other roots are supplied.
pub struct SystemTrust {
    verifier: Arc<WebPkiServerVerifier>,
}

impl fmt::Debug for SystemTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemTrust").finish_non_exhaustive()
    }
}

impl SystemTrust {
    /// Trust the roots bundled in `webpki-roots`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if the verifier cannot be built.
    pub fn new() -> Result<Self> {
        Self::with_roots(RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        ))
    }

    /// Trust exactly the given roots.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if the store is empty or the verifier cannot be built.
    pub fn with_roots(roots: RootCertStore) -> Result<Self> {
        let verifier =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), super::crypto_provider())
                .build()
                .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Self { verifier })
    }

    /// Like [`SystemTrust::with_roots`], with a specific crypto provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if the verifier cannot be built.
    pub fn with_provider(roots: RootCertStore, provider: Arc<CryptoProvider>) -> Result<Self> {
        let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Self { verifier })
    }
}

impl TrustEvaluator for SystemTrust {
    fn evaluate_trust(&self, chain: &[CertificateDer<'_>], domain: &str) -> Result<()> {
        let (end_entity, intermediates) = chain
            .split_first()
            .ok_or_else(|| Error::UntrustedCertificate("empty certificate chain".into()))?;
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|_| Error::UntrustedCertificate(format!("invalid server name {domain}")))?;

        self.verifier
            .verify_server_cert(end_entity, intermediates, &server_name, &[], UnixTime::now())
            .map(|_| ())
            .map_err(|e| Error::UntrustedCertificate(e.to_string()))
    }
}

/// Accepts every certificate.
///
/// This disables server authentication entirely and is only suitable for
/// tests and closed networks.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllTrust;

impl TrustEvaluator for AcceptAllTrust {
    fn evaluate_trust(&self, chain: &[CertificateDer<'_>], domain: &str) -> Result<()> {
        tracing::debug!(
            domain,
            certificates = chain.len(),
            "accepting certificate without validation"
        );
        Ok(())
    }
}

/// Accepts a chain only if it contains one of the pinned certificates.
#[derive(Debug, Clone)]
pub struct PinnedCertificates {
    pins: Vec<CertificateDer<'static>>,
}

impl PinnedCertificates {
    #[must_use]
    pub fn new(pins: Vec<CertificateDer<'static>>) -> Self {
        Self { pins }
    }

    /// Load the pins from PEM data.
    ///
    /// # Errors
    ///
    /// - `Error::Io` if the PEM data is malformed
    /// - `Error::Config` if it holds no certificates
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let mut reader = pem;
        let pins = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
        if pins.is_empty() {
            return Err(Error::Config("no certificates found in PEM data".into()));
        }
        Ok(Self::new(pins))
    }

    /// Load the pins from a PEM file.
    ///
    /// # Errors
    ///
    /// - `Error::Io` if the file cannot be read or is malformed
    /// - `Error::Config` if it holds no certificates
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let pins = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
        if pins.is_empty() {
            return Err(Error::Config(format!(
                "no certificates found in {}",
                path.display()
            )));
        }
        Ok(Self::new(pins))
    }

    #[must_use]
    pub fn pins(&self) -> &[CertificateDer<'static>] {
        &self.pins
    }
}

impl TrustEvaluator for PinnedCertificates {
    fn evaluate_trust(&self, chain: &[CertificateDer<'_>], domain: &str) -> Result<()> {
        let pinned = chain
            .iter()
            .any(|cert| self.pins.iter().any(|pin| pin.as_ref() == cert.as_ref()));
        if pinned {
            Ok(())
        } else {
            Err(Error::UntrustedCertificate(format!(
                "no pinned certificate in chain presented by {domain}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::error::ErrorKind;

    fn cert(bytes: &[u8]) -> CertificateDer<'static> {
        CertificateDer::from(bytes.to_vec())
    }

    #[test]
    fn test_accept_all() {
        assert!(AcceptAllTrust.evaluate_trust(&[], "example.com").is_ok());
        assert!(AcceptAllTrust.evaluate_trust(&[cert(b"junk")], "x").is_ok());
    }

    #[test]
    fn test_pinned_matches_any_position() {
        let pinned = PinnedCertificates::new(vec![cert(b"intermediate")]);
        assert!(pinned
            .evaluate_trust(&[cert(b"leaf"), cert(b"intermediate")], "example.com")
            .is_ok());

        let err = pinned
            .evaluate_trust(&[cert(b"leaf"), cert(b"other")], "example.com")
            .unwrap_err();
        assert!(matches!(err, Error::UntrustedCertificate(_)));
        assert_eq!(err.kind(), ErrorKind::Security);
    }

    #[test]
    fn test_system_trust_rejects_garbage() {
        let trust = SystemTrust::new().unwrap();
        assert!(matches!(
            trust.evaluate_trust(&[cert(b"not a certificate")], "example.com"),
            Err(Error::UntrustedCertificate(_))
        ));
        assert!(trust.evaluate_trust(&[], "example.com").is_err());
    }

    #[test]
    fn test_pem_without_certificates() {
        assert!(matches!(
            PinnedCertificates::from_pem(b"just some text\n"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_pem_file_not_found() {
        let result = PinnedCertificates::from_pem_file(Path::new("/nonexistent/path/cert.pem"));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_pem_file_empty() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"").unwrap();
        temp.flush().unwrap();
        assert!(matches!(
            PinnedCertificates::from_pem_file(temp.path()),
            Err(Error::Config(_))
        ));
    }
}
