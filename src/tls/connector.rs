//! Client-side TLS over intercepted connections.
//!
//! [`TlsClient`] runs the rustls handshake on top of a [`SniffedStream`] or
//! [`AsyncSniffedStream`] and wraps the result in a [`PlaintextTap`], so the
//! same connection is captured twice: ciphertext on the wire layer and
//! application bytes on the plaintext layer.
//!
//! # Example
//!
//! ```ignore
//! use wiretap::tls::TlsClient;
//!
//! let client = TlsClient::with_native_roots(wiretap.audit())?;
//! let stream = wiretap.interceptor().connect_async("api.example.com", 443).await?;
//! let mut tls = client.connect("api.example.com", stream).await?;
//! ```
//!
//! [`SniffedStream`]: crate::intercept::SniffedStream
//! [`AsyncSniffedStream`]: crate::intercept::AsyncSniffedStream

use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use rustls_pki_types::{CertificateDer, ServerName};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::capture::{PlaintextTap, Tapped, TlsCaptureAdapter};
use super::error::{TlsError, TlsResult};
use crate::telemetry::AuditLogger;

/// Load the platform's trusted root certificates.
///
/// Certificates that fail to load are skipped; an empty result is an error.
pub fn load_native_roots() -> TlsResult<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();

    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }
    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        return Err(TlsError::NoRootCertificates);
    }
    debug!("Loaded {} root certificates", root_store.len());
    Ok(root_store)
}

/// Load trust anchors from a PEM file.
pub fn load_pem_roots(path: &Path) -> TlsResult<RootCertStore> {
    let io_err = |source| TlsError::Io {
        path: path.display().to_string(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(io_err)?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(io_err)?;

    let mut root_store = RootCertStore::empty();
    let (added, ignored) = root_store.add_parsable_certificates(certs);
    if ignored > 0 {
        debug!("Ignored {} unparsable certificates in {}", ignored, path.display());
    }
    if added == 0 {
        return Err(TlsError::NoRootCertificates);
    }
    Ok(root_store)
}

/// Client configuration trusting `roots`.
pub fn client_config(roots: RootCertStore) -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Convert a domain string to a ServerName for TLS connection.
pub fn domain_to_server_name(domain: &str) -> TlsResult<ServerName<'static>> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| TlsError::InvalidServerName(domain.to_string()))
}

/// TLS client that captures plaintext on the connections it secures.
#[derive(Clone)]
pub struct TlsClient {
    config: Arc<ClientConfig>,
    adapter: TlsCaptureAdapter,
}

impl TlsClient {
    /// Client using an existing rustls configuration.
    pub fn new(config: Arc<ClientConfig>, audit: Arc<AuditLogger>) -> Self {
        Self {
            config,
            adapter: TlsCaptureAdapter::new(audit),
        }
    }

    /// Client trusting the platform roots.
    pub fn with_native_roots(audit: Arc<AuditLogger>) -> TlsResult<Self> {
        Ok(Self::new(client_config(load_native_roots()?), audit))
    }

    /// Client trusting the certificates of a PEM file.
    pub fn with_pem_roots(path: &Path, audit: Arc<AuditLogger>) -> TlsResult<Self> {
        Ok(Self::new(client_config(load_pem_roots(path)?), audit))
    }

    /// Handshake over a tokio stream.
    pub async fn connect<S>(
        &self,
        server_name: &str,
        stream: S,
    ) -> TlsResult<PlaintextTap<tokio_rustls::client::TlsStream<S>>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Tapped,
    {
        let name = domain_to_server_name(server_name)?;
        let tls = TlsConnector::from(Arc::clone(&self.config))
            .connect(name, stream)
            .await
            .map_err(|source| TlsError::Handshake {
                server: server_name.to_string(),
                source,
            })?;
        debug!("TLS established with {}", server_name);
        Ok(self.adapter.attach(tls))
    }

    /// Handshake over a blocking stream.
    pub fn connect_blocking<S>(
        &self,
        server_name: &str,
        stream: S,
    ) -> TlsResult<PlaintextTap<StreamOwned<ClientConnection, S>>>
    where
        S: Read + Write + Tapped,
    {
        let name = domain_to_server_name(server_name)?;
        let conn = ClientConnection::new(Arc::clone(&self.config), name)?;
        let mut tls = StreamOwned::new(conn, stream);

        while tls.conn.is_handshaking() {
            tls.conn
                .complete_io(&mut tls.sock)
                .map_err(|source| TlsError::Handshake {
                    server: server_name.to_string(),
                    source,
                })?;
        }
        debug!("TLS established with {}", server_name);
        Ok(self.adapter.attach(tls))
    }
}

impl std::fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_domain_to_server_name() {
        assert!(domain_to_server_name("example.com").is_ok());
        assert!(domain_to_server_name("127.0.0.1").is_ok());
        assert!(matches!(
            domain_to_server_name(""),
            Err(TlsError::InvalidServerName(_))
        ));
    }

    #[test]
    fn test_load_pem_roots_missing_file() {
        let err = load_pem_roots(Path::new("/nonexistent/wiretap-ca.pem")).unwrap_err();
        assert!(matches!(err, TlsError::Io { .. }));
    }

    #[test]
    fn test_load_pem_roots_without_certificates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let err = load_pem_roots(file.path()).unwrap_err();
        assert!(matches!(err, TlsError::NoRootCertificates));
    }

    #[test]
    fn test_load_pem_roots_self_signed() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(cert.cert.pem().as_bytes()).unwrap();

        let roots = load_pem_roots(file.path()).unwrap();
        assert_eq!(roots.len(), 1);
    }
}
