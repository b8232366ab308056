//! TLS configuration options.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::CertificateDer;

use crate::error::TlsError;

/// TLS protocol version bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    /// TLS 1.2.
    Tls12,
    /// TLS 1.3.
    Tls13,
}

/// TLS configuration for the in-band handshake.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    /// Accept any server certificate.
    ///
    /// **Warning:** This is insecure and should only be used for testing.
    pub trust_server_certificate: bool,

    /// Root certificates to trust. If empty, the Mozilla roots are used.
    pub root_certificates: Vec<CertificateDer<'static>>,

    /// Host name expected in the server certificate.
    ///
    /// Overrides the host the connection was made to.
    pub server_name: Option<String>,

    /// Minimum TLS version to accept.
    pub min_protocol_version: TlsVersion,

    /// Maximum TLS version to accept.
    ///
    /// Defaults to TLS 1.2. A TLS 1.3 server may send session tickets after
    /// the handshake, which a login-only session cannot absorb once it has
    /// dropped back to the raw transport.
    pub max_protocol_version: TlsVersion,

    /// Application-layer protocol negotiation (ALPN) protocols.
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            trust_server_certificate: false,
            root_certificates: Vec::new(),
            server_name: None,
            min_protocol_version: TlsVersion::Tls12,
            max_protocol_version: TlsVersion::Tls12,
            alpn_protocols: Vec::new(),
        }
    }
}

impl TlsConfig {
    /// Create a new TLS configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust the server certificate without validation.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Add a custom root certificate to trust.
    #[must_use]
    pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.root_certificates.push(cert);
        self
    }

    /// Trust every certificate in a PEM file (or a single DER certificate).
    pub fn with_ca_file(mut self, path: impl AsRef<Path>) -> Result<Self, TlsError> {
        let certs = load_ca_file(path.as_ref())?;
        self.root_certificates.extend(certs);
        Ok(self)
    }

    /// Set the host name expected in the server certificate.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Set the minimum TLS version.
    #[must_use]
    pub fn min_protocol_version(mut self, version: TlsVersion) -> Self {
        self.min_protocol_version = version;
        self
    }

    /// Set the maximum TLS version.
    #[must_use]
    pub fn max_protocol_version(mut self, version: TlsVersion) -> Self {
        self.max_protocol_version = version;
        self
    }

    /// Set ALPN protocols.
    #[must_use]
    pub fn alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }
}

fn load_ca_file(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file_error = |reason: String| TlsError::CertificateFile {
        path: path.to_path_buf(),
        reason,
    };

    let is_der = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("der") || ext.eq_ignore_ascii_case("cer"));
    if is_der {
        let der = std::fs::read(path).map_err(|e| file_error(e.to_string()))?;
        return Ok(vec![CertificateDer::from(der)]);
    }

    let file = File::open(path).map_err(|e| file_error(e.to_string()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| file_error(e.to_string()))?;
    if certs.is_empty() {
        return Err(file_error("no certificates found".into()));
    }
    Ok(certs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cap_at_tls12() {
        let config = TlsConfig::default();
        assert!(!config.trust_server_certificate);
        assert_eq!(config.max_protocol_version, TlsVersion::Tls12);
        assert!(config.server_name.is_none());
    }

    #[test]
    fn test_builder() {
        let config = TlsConfig::new()
            .trust_server_certificate(true)
            .with_server_name("db.internal")
            .max_protocol_version(TlsVersion::Tls13);
        assert!(config.trust_server_certificate);
        assert_eq!(config.server_name.as_deref(), Some("db.internal"));
        assert_eq!(config.max_protocol_version, TlsVersion::Tls13);
    }

    #[test]
    fn test_missing_ca_file() {
        let err = TlsConfig::new()
            .with_ca_file("/nonexistent/ca.pem")
            .unwrap_err();
        assert!(matches!(err, TlsError::CertificateFile { .. }));
    }

    #[test]
    fn test_pem_without_certificates() {
        let path = std::env::temp_dir().join(format!("tds-tls-empty-{}.pem", std::process::id()));
        std::fs::write(&path, "not a certificate\n").unwrap();
        let err = TlsConfig::new().with_ca_file(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, TlsError::CertificateFile { .. }));
    }
}
