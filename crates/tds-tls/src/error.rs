//! TLS-related error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while setting up or running the in-band TLS handshake.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    /// TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server name is not a valid DNS name or IP address.
    #[error("invalid server name for certificate validation: {0}")]
    InvalidServerName(String),

    /// A root certificate could not be added to the trust store.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The CA file could not be read or contained no certificates.
    #[error("failed to load CA certificates from {path}: {reason}")]
    CertificateFile {
        /// Path given in the configuration.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// TLS configuration error.
    #[error("TLS configuration error: {0}")]
    Configuration(String),

    /// A tunnelled handshake record arrived in a packet that is not PreLogin.
    #[error("expected a PreLogin packet during the TLS handshake, got 0x{0:02X}")]
    UnexpectedPacket(u8),

    /// IO error during TLS operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Rustls error.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}
