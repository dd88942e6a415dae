//! TLS error types.

use std::io;
use thiserror::Error;

/// Errors from TLS setup and handshakes on captured connections.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Handshake with the server failed.
    #[error("TLS handshake with {server} failed: {source}")]
    Handshake {
        /// Server name used for the handshake.
        server: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Client configuration could not be built.
    #[error("TLS configuration error: {0}")]
    Config(String),

    /// No trust anchors were available.
    #[error("No root certificates found")]
    NoRootCertificates,

    /// The name is not usable for SNI or certificate verification.
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    /// Reading certificate material failed.
    #[error("Failed to read certificates from {path}: {source}")]
    Io {
        /// File that was read.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Result type for TLS operations.
pub type TlsResult<T> = Result<T, TlsError>;

impl From<rustls::Error> for TlsError {
    fn from(err: rustls::Error) -> Self {
        TlsError::Config(err.to_string())
    }
}
