//! TLS connector for the in-band handshake.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector as TokioTlsConnector;
use tokio_rustls::client::TlsStream;

use crate::config::{TlsConfig, TlsVersion};
use crate::error::TlsError;
use crate::tunnel::PreLoginTunnel;

/// Accepts any server certificate (`trust_server_certificate`).
#[derive(Debug)]
struct DangerousServerCertVerifier;

impl ServerCertVerifier for DangerousServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// TLS connector for SQL Server connections.
///
/// The handshake runs inside PreLogin packets through a [`PreLoginTunnel`];
/// once it completes the tunnel passes TLS records through unframed and the
/// packet framer sits on top of the TLS stream.
pub struct TlsConnector {
    config: TlsConfig,
    inner: TokioTlsConnector,
}

impl TlsConnector {
    /// Create a connector from `config`.
    pub fn new(config: TlsConfig) -> Result<Self, TlsError> {
        let client_config = Self::build_client_config(&config)?;
        let inner = TokioTlsConnector::from(Arc::new(client_config));
        Ok(Self { config, inner })
    }

    fn build_client_config(config: &TlsConfig) -> Result<ClientConfig, TlsError> {
        let versions = Self::select_versions(config)?;

        let mut client_config = if config.trust_server_certificate {
            tracing::warn!(
                "trust_server_certificate is enabled, server certificate validation is disabled"
            );
            ClientConfig::builder_with_protocol_versions(&versions)
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(DangerousServerCertVerifier))
                .with_no_client_auth()
        } else {
            ClientConfig::builder_with_protocol_versions(&versions)
                .with_root_certificates(Self::build_root_store(config)?)
                .with_no_client_auth()
        };

        client_config.alpn_protocols = config.alpn_protocols.clone();
        Ok(client_config)
    }

    fn build_root_store(config: &TlsConfig) -> Result<RootCertStore, TlsError> {
        let mut root_store = RootCertStore::empty();
        if config.root_certificates.is_empty() {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert in &config.root_certificates {
                root_store
                    .add(cert.clone())
                    .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
            }
        }
        Ok(root_store)
    }

    fn select_versions(
        config: &TlsConfig,
    ) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, TlsError> {
        let wanted = config.min_protocol_version..=config.max_protocol_version;
        let mut versions = Vec::new();
        if wanted.contains(&TlsVersion::Tls12) {
            versions.push(&rustls::version::TLS12);
        }
        if wanted.contains(&TlsVersion::Tls13) {
            versions.push(&rustls::version::TLS13);
        }
        if versions.is_empty() {
            return Err(TlsError::Configuration(format!(
                "minimum TLS version {:?} is above maximum {:?}",
                config.min_protocol_version, config.max_protocol_version
            )));
        }
        Ok(versions)
    }

    /// Name checked against the server certificate when connecting to `host`.
    ///
    /// A configured `server_name` wins; otherwise the host itself is used, so
    /// a redirected connection validates against the routed server.
    #[must_use]
    pub fn certificate_host<'a>(&'a self, host: &'a str) -> &'a str {
        self.config.server_name.as_deref().unwrap_or(host)
    }

    /// Run the TLS handshake through PreLogin packets of `packet_size` bytes.
    ///
    /// On success the tunnel has been switched to pass-through.
    pub async fn connect<S>(
        &self,
        stream: S,
        host: &str,
        packet_size: usize,
    ) -> Result<TlsStream<PreLoginTunnel<S>>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = self.certificate_host(host);
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|_| TlsError::InvalidServerName(name.to_string()))?;

        tracing::debug!(server_name = %name, packet_size, "performing TLS handshake");

        let tunnel = PreLoginTunnel::new(stream, packet_size);
        let mut tls_stream = self
            .inner
            .connect(server_name, tunnel)
            .await
            .map_err(|e| TlsError::HandshakeFailed(e.to_string()))?;
        tls_stream.get_mut().0.handshake_complete();

        tracing::debug!("TLS handshake completed");
        Ok(tls_stream)
    }

    /// Configuration this connector was built from.
    #[must_use]
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn setup_crypto_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    #[test]
    fn test_default_config() {
        setup_crypto_provider();
        assert!(TlsConnector::new(TlsConfig::default()).is_ok());
    }

    #[test]
    fn test_trust_server_certificate() {
        setup_crypto_provider();
        let connector = TlsConnector::new(TlsConfig::new().trust_server_certificate(true)).unwrap();
        assert!(connector.config().trust_server_certificate);
    }

    #[test]
    fn test_inverted_version_range_rejected() {
        setup_crypto_provider();
        let config = TlsConfig::new()
            .min_protocol_version(TlsVersion::Tls13)
            .max_protocol_version(TlsVersion::Tls12);
        assert!(matches!(
            TlsConnector::new(config),
            Err(TlsError::Configuration(_))
        ));
    }

    #[test]
    fn test_certificate_host_follows_connection_unless_pinned() {
        setup_crypto_provider();
        let connector = TlsConnector::new(TlsConfig::default()).unwrap();
        assert_eq!(connector.certificate_host("replica-2"), "replica-2");

        let pinned =
            TlsConnector::new(TlsConfig::new().with_server_name("sql.example.com")).unwrap();
        assert_eq!(pinned.certificate_host("replica-2"), "sql.example.com");
    }
}
