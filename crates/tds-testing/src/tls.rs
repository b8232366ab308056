//! Throwaway TLS identity for the mock server.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::TlsAcceptor;

use crate::mock_server::{MockServerError, Result};

/// Self-signed certificate and its key.
#[derive(Debug)]
pub struct TlsIdentity {
    /// DER certificate, usable as a trust root by clients.
    pub certificate: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Generate a certificate valid for `hosts`.
    pub fn self_signed(hosts: &[&str]) -> Result<Self> {
        let names = hosts.iter().map(|h| (*h).to_owned()).collect::<Vec<_>>();
        let key_pair = rcgen::KeyPair::generate().map_err(tls_error)?;
        let cert = rcgen::CertificateParams::new(names)
            .map_err(tls_error)?
            .self_signed(&key_pair)
            .map_err(tls_error)?;
        Ok(Self {
            certificate: cert.der().clone(),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        })
    }

    /// TLS 1.2 acceptor presenting this identity.
    ///
    /// SQL Server negotiates TLS 1.2 inside Pre-Login packets.
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12])
            .map_err(tls_error)?
            .with_no_client_auth()
            .with_single_cert(vec![self.certificate.clone()], self.key.clone_key())
            .map_err(tls_error)?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn tls_error(err: impl std::fmt::Display) -> MockServerError {
    MockServerError::Tls(err.to_string())
}
