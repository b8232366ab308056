//! Mock TDS server for unit testing.
//!
//! The server speaks enough of the protocol to drive a client through every
//! login branch: Pre-Login with any encryption level, the TLS handshake
//! tunnelled through Pre-Login packets, LOGIN7 followed by SSPI or
//! federated-authentication rounds, routing redirects and packet size
//! renegotiation. After login it answers SQL batches with scripted token
//! streams and acknowledges ATTENTION.
//!
//! Everything the client sends is recorded for assertions.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_testing::mock_server::{MockResponse, MockTdsServer};
//!
//! #[tokio::test]
//! async fn test_query() {
//!     let server = MockTdsServer::builder()
//!         .with_response("DELETE FROM jobs", MockResponse::rows_affected(3))
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     // Connect a client to server.host():server.port()...
//!     let recorded = server.recorded().await;
//!     assert_eq!(recorded.batches[0].sql, "DELETE FROM jobs");
//! }
//! ```

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use rustls::pki_types::CertificateDer;
use tds_framer::{FramerError, PacketFramer};
use tds_protocol::ProtocolError;
use tds_protocol::codec::decode_ucs2;
use tds_protocol::feature_ext::{FeatureId, FedAuthLibrary, decode_fed_auth_token};
use tds_protocol::login7::Login7;
use tds_protocol::packet::{DEFAULT_PACKET_SIZE, PacketType, clamp_packet_size};
use tds_protocol::prelogin::{EncryptionLevel, PreLogin};
use tds_protocol::sql_batch::SqlBatch;
use tds_protocol::token::{
    DoneStatus, EnvChange, EnvChangeType, FeatureExtAck, FedAuthInfo, LoginAck,
};
use tds_protocol::version::{SqlServerVersion, TdsVersion};
use tds_tls::PreLoginTunnel;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use crate::tls::TlsIdentity;
use crate::tokens::TokenStreamBuilder;

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Packet framing error.
    #[error("framing error: {0}")]
    Framer(#[from] FramerError),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Certificate or TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<ProtocolError> for MockServerError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// Scripted reply to a SQL batch.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Token stream sent as one TabularResult message.
    Tokens(Bytes),
    /// ERROR followed by DONE with the error bit.
    Error {
        /// Error number.
        number: i32,
        /// Severity.
        class: u8,
        /// Message text.
        message: String,
    },
    /// DONE with a row count.
    RowsAffected(u64),
    /// No reply; the request stays outstanding until the client cancels.
    Stall,
}

impl MockResponse {
    /// Reply with a prepared token stream.
    pub fn tokens(tokens: Bytes) -> Self {
        Self::Tokens(tokens)
    }

    /// Reply with a server error.
    pub fn error(number: i32, class: u8, message: impl Into<String>) -> Self {
        Self::Error {
            number,
            class,
            message: message.into(),
        }
    }

    /// Reply with a row count.
    pub fn rows_affected(count: u64) -> Self {
        Self::RowsAffected(count)
    }

    /// Reply with a bare DONE.
    pub fn empty() -> Self {
        Self::RowsAffected(0)
    }

    fn encode(&self) -> Result<Option<Bytes>> {
        let tokens = match self {
            Self::Tokens(tokens) => return Ok(Some(tokens.clone())),
            Self::Stall => return Ok(None),
            Self::Error {
                number,
                class,
                message,
            } => TokenStreamBuilder::new()
                .error(*number, *class, message)
                .done(DoneStatus::ERROR, 0),
            Self::RowsAffected(0) => TokenStreamBuilder::new().done(DoneStatus::empty(), 0),
            Self::RowsAffected(count) => {
                TokenStreamBuilder::new().done(DoneStatus::COUNT, *count)
            }
        };
        tokens.build().map(Some)
    }
}

#[derive(Debug, Clone)]
enum Routing {
    To { host: String, port: u16 },
    ToSelf,
}

/// Configuration for the mock TDS server.
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    responses: HashMap<String, MockResponse>,
    default_response: MockResponse,
    server_name: String,
    database: String,
    encryption: EncryptionLevel,
    identity: Option<Arc<TlsIdentity>>,
    fed_auth_required: Option<bool>,
    nonce: Option<[u8; 32]>,
    fed_auth_info: FedAuthInfo,
    sspi_rounds: usize,
    login_error: Option<(i32, String)>,
    packet_size: Option<u32>,
    routing: Option<Routing>,
}

impl MockServerConfig {
    fn response_for(&self, sql: &str) -> &MockResponse {
        self.responses
            .get(&normalize(sql))
            .unwrap_or(&self.default_response)
    }
}

/// Builder for `MockTdsServer`.
#[derive(Debug)]
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Create a new builder with default settings.
    ///
    /// The default server does not support encryption and accepts any
    /// login.
    pub fn new() -> Self {
        Self {
            config: MockServerConfig {
                responses: HashMap::new(),
                default_response: MockResponse::empty(),
                server_name: "MockSQLServer".to_string(),
                database: "master".to_string(),
                encryption: EncryptionLevel::NotSupported,
                identity: None,
                fed_auth_required: None,
                nonce: None,
                fed_auth_info: FedAuthInfo {
                    sts_url: "https://login.example.com/tenant".into(),
                    spn: "https://database.example.com/".into(),
                },
                sspi_rounds: 0,
                login_error: None,
                packet_size: None,
                routing: None,
            },
        }
    }

    /// Add a response for a specific SQL batch.
    ///
    /// Matching ignores case and surrounding whitespace.
    pub fn with_response(mut self, sql: impl AsRef<str>, response: MockResponse) -> Self {
        self.config.responses.insert(normalize(sql.as_ref()), response);
        self
    }

    /// Set the default response for unmatched batches.
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.config.default_response = response;
        self
    }

    /// Set the server name reported in LoginAck.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Set the database announced after login.
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.config.database = db.into();
        self
    }

    /// Encryption level answered in Pre-Login.
    ///
    /// Any level but `NotSupported` gets a self-signed certificate for
    /// `localhost` and `127.0.0.1` unless one is supplied.
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.config.encryption = level;
        self
    }

    /// Present this identity during the TLS handshake.
    pub fn with_identity(mut self, identity: TlsIdentity) -> Self {
        self.config.identity = Some(Arc::new(identity));
        self
    }

    /// FEDAUTHREQUIRED value answered in Pre-Login.
    ///
    /// Sent whether or not the client asked, so tests can provoke a
    /// mismatch.
    pub fn with_fed_auth_required(mut self, required: bool) -> Self {
        self.config.fed_auth_required = Some(required);
        self
    }

    /// Nonce answered in Pre-Login.
    pub fn with_nonce(mut self, nonce: [u8; 32]) -> Self {
        self.config.nonce = Some(nonce);
        self
    }

    /// FEDAUTHINFO sent to ADAL-workflow logins.
    pub fn with_fed_auth_info(mut self, sts_url: impl Into<String>, spn: impl Into<String>) -> Self {
        self.config.fed_auth_info = FedAuthInfo {
            sts_url: sts_url.into(),
            spn: spn.into(),
        };
        self
    }

    /// SSPI challenges sent to integrated logins before the LoginAck.
    ///
    /// Each challenge waits for the client's answer.
    pub fn with_sspi_rounds(mut self, rounds: usize) -> Self {
        self.config.sspi_rounds = rounds;
        self
    }

    /// Reject every login with this error.
    pub fn with_login_error(mut self, number: i32, message: impl Into<String>) -> Self {
        self.config.login_error = Some((number, message.into()));
        self
    }

    /// Packet size acknowledged after login.
    ///
    /// Without it the server accepts the size the client asked for.
    pub fn with_packet_size(mut self, size: u32) -> Self {
        self.config.packet_size = Some(size);
        self
    }

    /// Acknowledge logins, then redirect to `host:port`.
    pub fn with_routing(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.routing = Some(Routing::To {
            host: host.into(),
            port,
        });
        self
    }

    /// Redirect every login back to this server.
    pub fn route_to_self(mut self) -> Self {
        self.config.routing = Some(Routing::ToSelf);
        self
    }

    /// Build and start the mock server.
    pub async fn build(mut self) -> Result<MockTdsServer> {
        if self.config.encryption != EncryptionLevel::NotSupported
            && self.config.identity.is_none()
        {
            let identity = TlsIdentity::self_signed(&["localhost", "127.0.0.1"])?;
            self.config.identity = Some(Arc::new(identity));
        }
        MockTdsServer::start(self.config).await
    }
}

impl Default for MockServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything clients sent to a server.
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    /// Pre-Login records.
    pub pre_logins: Vec<PreLogin>,
    /// LOGIN7 records, passwords deobfuscated.
    pub logins: Vec<Login7>,
    /// SQL batches.
    pub batches: Vec<SqlBatch>,
    /// SSPI blobs: the one in LOGIN7, then each answer.
    pub sspi: Vec<Bytes>,
    /// Federated-authentication tokens, from the feature or a token message.
    pub fed_auth_tokens: Vec<String>,
    /// ATTENTION signals received.
    pub attentions: usize,
}

struct Shared {
    addr: SocketAddr,
    config: MockServerConfig,
    acceptor: Option<TlsAcceptor>,
    recorded: Mutex<Recorded>,
    connection_count: Mutex<usize>,
}

/// A mock TDS server for testing.
///
/// Each accepted connection runs on its own task until the client
/// disconnects or the server is dropped.
pub struct MockTdsServer {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    shared: Arc<Shared>,
}

impl MockTdsServer {
    /// Create a new builder for the mock server.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start the mock server on an available port.
    pub async fn start(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let acceptor = config
            .identity
            .as_ref()
            .map(|identity| identity.acceptor())
            .transpose()?;
        let shared = Arc::new(Shared {
            addr,
            config,
            acceptor,
            recorded: Mutex::new(Recorded::default()),
            connection_count: Mutex::new(0),
        });

        let mut shutdown_rx = shutdown_tx.subscribe();
        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                tracing::debug!(%peer, "mock server accepted connection");
                                let shared = Arc::clone(&accept_shared);
                                tokio::spawn(async move {
                                    *shared.connection_count.lock().await += 1;
                                    if let Err(e) = handle_connection(stream, &shared).await {
                                        tracing::debug!("Connection error: {}", e);
                                    }
                                    let mut count = shared.connection_count.lock().await;
                                    *count = count.saturating_sub(1);
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            shutdown_tx,
            shared,
        })
    }

    /// Get the server's listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the host string for connection configuration.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Get the port number.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Certificate presented during TLS, for clients that validate it.
    pub fn certificate(&self) -> Option<CertificateDer<'static>> {
        self.shared
            .config
            .identity
            .as_ref()
            .map(|identity| identity.certificate.clone())
    }

    /// Get the current connection count.
    pub async fn connection_count(&self) -> usize {
        *self.shared.connection_count.lock().await
    }

    /// Snapshot of what clients have sent so far.
    pub async fn recorded(&self) -> Recorded {
        self.shared.recorded.lock().await.clone()
    }

    /// Stop accepting connections.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockTdsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MockTdsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTdsServer")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// What the server does with TLS after Pre-Login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encryption {
    None,
    LoginOnly,
    Full,
}

fn negotiated(client: EncryptionLevel, server: EncryptionLevel) -> Encryption {
    use EncryptionLevel::{NotSupported, Off};
    match (client, server) {
        (NotSupported, _) | (_, NotSupported) => Encryption::None,
        (Off, Off) => Encryption::LoginOnly,
        // The client gives up on an unencrypted server.
        (_, Off) => Encryption::None,
        _ => Encryption::Full,
    }
}

type Framer = PacketFramer<ServerStream>;

/// Handle a single client connection.
async fn handle_connection(stream: TcpStream, shared: &Shared) -> Result<()> {
    let config = &shared.config;
    stream.set_nodelay(true)?;
    let mut framer = Framer::new(ServerStream::Plain(stream), DEFAULT_PACKET_SIZE)?;

    // Step 1: Pre-Login
    let payload = expect_message(&mut framer, PacketType::PreLogin).await?;
    let client = PreLogin::decode(payload)?;
    let encryption = negotiated(client.encryption, config.encryption);
    let mut reply = PreLogin::new()
        .with_version(SqlServerVersion::from_raw(0x1000_0FA0, 0))
        .with_encryption(config.encryption);
    if let Some(required) = config.fed_auth_required {
        reply = reply.with_fed_auth_required(required);
    }
    if let Some(nonce) = config.nonce {
        reply = reply.with_nonce(nonce);
    }
    shared.recorded.lock().await.pre_logins.push(client);
    framer
        .send_message(PacketType::TabularResult, &reply.encode())
        .await?;

    // Step 2: TLS
    if encryption != Encryption::None {
        let acceptor = shared
            .acceptor
            .as_ref()
            .ok_or_else(|| MockServerError::Tls("no server identity".into()))?;
        framer = accept_tls(framer, acceptor).await?;
    }

    // Step 3: LOGIN7
    let payload = expect_message(&mut framer, PacketType::Login7).await?;
    let login = Login7::decode(payload)?;
    if encryption == Encryption::LoginOnly {
        let tcp = framer.into_inner()?.into_plain();
        framer = Framer::new(ServerStream::Plain(tcp), DEFAULT_PACKET_SIZE)?;
    }
    tracing::debug!(user = %login.username, database = %login.database, "mock server login");

    let fed_auth = authenticate(&mut framer, &login, shared).await?;
    let requested = login.packet_size;
    shared.recorded.lock().await.logins.push(login);

    if let Some((number, message)) = &config.login_error {
        let tokens = TokenStreamBuilder::new()
            .error(*number, 14, message)
            .done(DoneStatus::ERROR, 0)
            .build()?;
        framer.send_message(PacketType::TabularResult, &tokens).await?;
        return Ok(());
    }

    // Step 4: login response
    let packet_size = clamp_packet_size(config.packet_size.unwrap_or(requested) as usize) as u32;
    let mut tokens = TokenStreamBuilder::new()
        .env_change(&EnvChange::text(
            EnvChangeType::Database,
            config.database.as_str(),
            "master",
        ))
        .info(5701, &format!("Changed database context to '{}'.", config.database))
        .login_ack(&LoginAck {
            interface: 1,
            tds_version: TdsVersion::V7_4,
            prog_name: config.server_name.clone(),
            prog_version: [16, 0, 0x0F, 0xA0],
        });
    if fed_auth {
        tokens = tokens.feature_ext_ack(&FeatureExtAck {
            features: vec![(FeatureId::FedAuth as u8, Bytes::new())],
        });
    }
    if packet_size as usize != DEFAULT_PACKET_SIZE {
        tokens = tokens.env_change(&EnvChange::packet_size(
            packet_size,
            DEFAULT_PACKET_SIZE as u32,
        ));
    }
    let routed = match &config.routing {
        Some(Routing::To { host, port }) => Some((host.clone(), *port)),
        Some(Routing::ToSelf) => Some((shared.addr.ip().to_string(), shared.addr.port())),
        None => None,
    };
    if let Some((host, port)) = &routed {
        tokens = tokens.env_change(&EnvChange::routing(host.as_str(), *port));
    }
    let tokens = tokens.done(DoneStatus::empty(), 0).build()?;
    framer.send_message(PacketType::TabularResult, &tokens).await?;
    if routed.is_some() {
        return Ok(());
    }
    framer.resize(packet_size as usize).await?;

    // Step 5: requests
    serve(&mut framer, shared).await
}

async fn serve(framer: &mut Framer, shared: &Shared) -> Result<()> {
    loop {
        let (packet_type, payload) = match framer.read_message().await {
            Ok(message) => message,
            Err(FramerError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match packet_type {
            PacketType::SqlBatch => {
                let batch = SqlBatch::decode(payload)?;
                let response = shared.config.response_for(&batch.sql).encode()?;
                tracing::debug!(sql = %batch.sql, "mock server batch");
                shared.recorded.lock().await.batches.push(batch);
                if let Some(tokens) = response {
                    framer.send_message(PacketType::TabularResult, &tokens).await?;
                }
            }
            PacketType::Attention => {
                shared.recorded.lock().await.attentions += 1;
                let ack = TokenStreamBuilder::new().done(DoneStatus::ATTN, 0).build()?;
                framer.send_message(PacketType::TabularResult, &ack).await?;
            }
            other => {
                return Err(MockServerError::Protocol(format!(
                    "Unexpected {other:?} request"
                )));
            }
        }
    }
}

/// Run the SSPI or federated-authentication exchange a login asks for.
///
/// Returns whether the login used federated authentication.
async fn authenticate(framer: &mut Framer, login: &Login7, shared: &Shared) -> Result<bool> {
    let config = &shared.config;
    if let Some(feature) = login.features.get(FeatureId::FedAuth as u8) {
        let mut data = feature.clone();
        if !data.has_remaining() {
            return Err(MockServerError::Protocol("empty FEDAUTH feature".into()));
        }
        let library = data.get_u8() >> 1;
        let token = if library == FedAuthLibrary::Adal as u8 {
            let info = TokenStreamBuilder::new()
                .fed_auth_info(&config.fed_auth_info)
                .build()?;
            framer.send_message(PacketType::TabularResult, &info).await?;
            let payload = expect_message(framer, PacketType::FedAuthToken).await?;
            decode_fed_auth_token(payload)?
        } else {
            if data.remaining() < 4 {
                return Err(MockServerError::Protocol("short FEDAUTH token".into()));
            }
            let len = data.get_u32_le() as usize;
            let raw = data
                .get(..len)
                .ok_or_else(|| MockServerError::Protocol("short FEDAUTH token".into()))?;
            decode_ucs2(raw)?
        };
        shared.recorded.lock().await.fed_auth_tokens.push(token);
        return Ok(true);
    }

    if !login.sspi.is_empty() {
        shared.recorded.lock().await.sspi.push(login.sspi.clone());
        for round in 0..config.sspi_rounds {
            let challenge = format!("challenge-{round}");
            let tokens = TokenStreamBuilder::new().sspi(challenge.as_bytes()).build()?;
            framer.send_message(PacketType::TabularResult, &tokens).await?;
            let answer = expect_message(framer, PacketType::Sspi).await?;
            shared.recorded.lock().await.sspi.push(answer);
        }
    }
    Ok(false)
}

async fn expect_message(framer: &mut Framer, expected: PacketType) -> Result<Bytes> {
    let (packet_type, payload) = framer.read_message().await?;
    if packet_type != expected {
        return Err(MockServerError::Protocol(format!(
            "Expected {expected:?}, got {packet_type:?}"
        )));
    }
    Ok(payload)
}

async fn accept_tls(framer: Framer, acceptor: &TlsAcceptor) -> Result<Framer> {
    let tcp = framer.into_inner()?.into_plain();
    let mut tls = acceptor
        .accept(PreLoginTunnel::new(tcp, DEFAULT_PACKET_SIZE))
        .await?;
    tls.get_mut().0.handshake_complete();
    tracing::debug!("mock server TLS handshake complete");
    Ok(Framer::new(
        ServerStream::Tls(Box::new(tls)),
        DEFAULT_PACKET_SIZE,
    )?)
}

fn normalize(sql: &str) -> String {
    sql.trim().to_uppercase()
}

/// Server side of a connection, with or without TLS.
enum ServerStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<PreLoginTunnel<TcpStream>>>),
}

impl ServerStream {
    fn into_plain(self) -> TcpStream {
        match self {
            Self::Plain(tcp) => tcp,
            Self::Tls(tls) => tls.into_inner().0.into_inner(),
        }
    }
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            Self::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            Self::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            Self::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            Self::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiated_encryption() {
        use EncryptionLevel::*;
        assert_eq!(negotiated(Off, Off), Encryption::LoginOnly);
        assert_eq!(negotiated(Off, On), Encryption::Full);
        assert_eq!(negotiated(On, Required), Encryption::Full);
        assert_eq!(negotiated(NotSupported, Required), Encryption::None);
        assert_eq!(negotiated(On, Off), Encryption::None);
    }

    #[test]
    fn test_response_lookup_is_normalized() {
        let config = MockServerBuilder::new()
            .with_response("select 1", MockResponse::rows_affected(1))
            .config;
        assert!(matches!(
            config.response_for("  SELECT 1 "),
            MockResponse::RowsAffected(1)
        ));
        assert!(matches!(
            config.response_for("SELECT 2"),
            MockResponse::RowsAffected(0)
        ));
    }

    #[test]
    fn test_error_response_tokens() {
        let tokens = MockResponse::error(208, 16, "Invalid object name")
            .encode()
            .unwrap()
            .unwrap();
        assert_eq!(tokens[0], 0xAA);
        // DONE is the trailing 13 bytes.
        assert_eq!(tokens[tokens.len() - 13], 0xFD);
        assert!(MockResponse::Stall.encode().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let server = MockTdsServer::builder().build().await.unwrap();
        assert_ne!(server.port(), 0);
        assert_eq!(server.host(), "127.0.0.1");
        assert!(server.certificate().is_none());
        assert_eq!(server.connection_count().await, 0);
        assert!(server.recorded().await.logins.is_empty());
        server.stop();
    }

    #[tokio::test]
    async fn test_encrypting_server_has_certificate() {
        let server = MockTdsServer::builder()
            .with_encryption(EncryptionLevel::Required)
            .build()
            .await
            .unwrap();
        assert!(server.certificate().is_some());
    }
}
