//! TLS handshakes tunnelled through PreLogin packets over a loopback pipe.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tds_tls::{PreLoginTunnel, TlsConfig, TlsConnector, TlsError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_rustls::TlsAcceptor;

fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn self_signed(host: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec![host.to_string()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    (cert.der().clone(), key)
}

fn acceptor(cert: CertificateDer<'static>, key: PrivateKeyDer<'static>) -> TlsAcceptor {
    let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

async fn echo_server(stream: DuplexStream, acceptor: TlsAcceptor) {
    let tunnel = PreLoginTunnel::new(stream, 512);
    let Ok(mut tls) = acceptor.accept(tunnel).await else {
        return;
    };
    tls.get_mut().0.handshake_complete();
    let mut buf = [0u8; 5];
    tls.read_exact(&mut buf).await.unwrap();
    tls.write_all(&buf).await.unwrap();
    tls.flush().await.unwrap();
}

#[tokio::test]
async fn handshake_with_trusted_root() {
    install_provider();
    let (cert, key) = self_signed("localhost");
    let (client, server) = tokio::io::duplex(64 * 1024);
    let server_task = tokio::spawn(echo_server(server, acceptor(cert.clone(), key)));

    let connector = TlsConnector::new(TlsConfig::new().add_root_certificate(cert)).unwrap();
    let mut tls = connector.connect(client, "localhost", 512).await.unwrap();
    assert!(!tls.get_ref().0.is_handshaking());

    tls.write_all(b"hello").await.unwrap();
    tls.flush().await.unwrap();
    let mut reply = [0u8; 5];
    tls.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"hello");

    server_task.await.unwrap();
}

#[tokio::test]
async fn untrusted_certificate_fails() {
    install_provider();
    let (cert, key) = self_signed("localhost");
    let (other_root, _) = self_signed("localhost");
    let (client, server) = tokio::io::duplex(64 * 1024);
    let server_task = tokio::spawn(echo_server(server, acceptor(cert, key)));

    let connector = TlsConnector::new(TlsConfig::new().add_root_certificate(other_root)).unwrap();
    let err = connector.connect(client, "localhost", 4096).await.unwrap_err();
    assert!(matches!(err, TlsError::HandshakeFailed(_)));

    server_task.await.unwrap();
}

#[tokio::test]
async fn trust_server_certificate_skips_validation() {
    install_provider();
    let (cert, key) = self_signed("some-other-host");
    let (client, server) = tokio::io::duplex(64 * 1024);
    let server_task = tokio::spawn(echo_server(server, acceptor(cert, key)));

    let connector = TlsConnector::new(TlsConfig::new().trust_server_certificate(true)).unwrap();
    let mut tls = connector.connect(client, "localhost", 4096).await.unwrap();
    tls.write_all(b"12345").await.unwrap();
    tls.flush().await.unwrap();
    let mut reply = [0u8; 5];
    tls.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"12345");

    server_task.await.unwrap();
}
