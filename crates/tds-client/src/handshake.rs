//! Connection establishment: Pre-Login, in-band TLS, LOGIN7 and the
//! post-login token loop.
//!
//! The sequencer walks
//! `Disconnected -> PreLoginSent -> PreLoginReceived -> [TlsHandshake] ->
//! LoginSent -> LoginAcknowledged`. A routing ENVCHANGE seen during login
//! sends it back to `Disconnected` against the routed endpoint with the same
//! credentials, up to [`RedirectConfig::max_redirects`] times.
//!
//! [`RedirectConfig::max_redirects`]: crate::config::RedirectConfig::max_redirects

use std::sync::Arc;

use tds_auth::{AuthError, Credentials, FedAuthContext, SspiSession, SspiTarget};
use tds_framer::PacketFramer;
use tds_protocol::feature_ext::{FeatureExtensions, encode_fed_auth_token};
use tds_protocol::packet::{DEFAULT_PACKET_SIZE, PacketType};
use tds_protocol::prelogin::{EncryptionLevel, PreLogin};
use tds_protocol::token::RoutingTarget;
use tds_protocol::Login7;
use tds_tls::TlsConnector;
use tds_types::{StandardRegistry, TypeRegistry};
use tokio::net::TcpStream;

use crate::browser;
use crate::config::{Config, DEFAULT_PORT, EncryptionMode};
use crate::decoder::{MessageObserver, TokenDecoder};
use crate::error::{Error, HandshakePhase, Result};
use crate::event::ProtocolEvent;
use crate::session::Session;
use crate::state::SessionState;
use crate::transport::Transport;

/// Where the handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No connection to the current endpoint yet.
    Disconnected,
    /// Pre-Login record written.
    PreLoginSent,
    /// Server Pre-Login reply read and negotiated.
    PreLoginReceived,
    /// TLS records are being exchanged inside Pre-Login packets.
    TlsHandshake,
    /// LOGIN7 written; reading the login response.
    LoginSent,
    /// The server acknowledged the login.
    LoginAcknowledged,
}

/// Outcome of encryption negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    /// No TLS at all.
    None,
    /// TLS protects LOGIN7 only; everything after it is plain.
    LoginOnly,
    /// TLS for the rest of the connection.
    Full,
}

/// Combine the client's policy with the server's Pre-Login answer.
///
/// Fails closed: a client requiring encryption never proceeds against a
/// server that cannot provide it, and a client without TLS support never
/// proceeds against a server that demands it.
pub fn negotiate_encryption(client: EncryptionMode, server: EncryptionLevel) -> Result<Encryption> {
    use EncryptionLevel as Server;

    match (client, server) {
        (EncryptionMode::On, Server::Off | Server::NotSupported) => Err(Error::Negotiation(
            format!("encryption is required but the server answered {server:?}"),
        )),
        (EncryptionMode::NotSupported, Server::On | Server::Required) => Err(Error::Negotiation(
            format!("the server requires encryption ({server:?}) but TLS is disabled"),
        )),
        (EncryptionMode::NotSupported, _) | (_, Server::NotSupported) => Ok(Encryption::None),
        (EncryptionMode::Off, Server::Off) => Ok(Encryption::LoginOnly),
        _ => Ok(Encryption::Full),
    }
}

/// Check the server's FEDAUTHREQUIRED answer against the credentials.
///
/// Returns the value to echo in the LOGIN7 FEDAUTH feature.
pub fn negotiate_fed_auth(client_federated: bool, server: Option<bool>) -> Result<bool> {
    match (client_federated, server) {
        (true, None) => Err(Error::Negotiation(
            "federated authentication requested but the server does not support it".into(),
        )),
        (false, Some(true)) => Err(Error::Negotiation(
            "the server requires federated authentication but none is configured".into(),
        )),
        (_, echo) => Ok(echo.unwrap_or(false)),
    }
}

/// Host and port of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    async fn resolve(config: &Config) -> Result<Self> {
        let port = match (config.port, config.instance.as_deref()) {
            (Some(port), Some(instance)) => {
                tracing::warn!(
                    port,
                    instance = %instance,
                    "explicit port given, instance name ignored for port resolution"
                );
                port
            }
            (Some(port), None) => port,
            (None, Some(instance)) => {
                browser::resolve_instance(&config.host, instance, config.timeouts.browser_timeout)
                    .await?
            }
            (None, None) => DEFAULT_PORT,
        };
        Ok(Self {
            host: config.host.clone(),
            port,
        })
    }
}

enum Attempt {
    Established(Session),
    Redirect(RoutingTarget),
}

/// Connection establishment for one [`Config`].
///
/// # Example
///
/// ```rust,ignore
/// use tds_client::{Config, Handshake};
///
/// let session = Handshake::new(config).connect().await?;
/// ```
pub struct Handshake {
    config: Config,
    registry: Arc<dyn TypeRegistry>,
    observer: Option<MessageObserver>,
    state: HandshakeState,
}

impl Handshake {
    /// Handshake using the [`StandardRegistry`] for column data.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Arc::new(StandardRegistry::new()),
            observer: None,
            state: HandshakeState::Disconnected,
        }
    }

    /// Decode column data with `registry`.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn TypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Deliver INFO tokens to `observer`, login messages included.
    #[must_use]
    pub fn with_observer(mut self, observer: MessageObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the handshake to an authenticated session.
    ///
    /// The whole sequence, redirects included, is bounded by the login
    /// timeout.
    pub async fn connect(self) -> Result<Session> {
        self.config.validate()?;
        let login_timeout = self.config.timeouts.login_timeout;
        tokio::time::timeout(login_timeout, self.run())
            .await
            .map_err(|_| Error::Timeout(login_timeout))?
    }

    async fn run(mut self) -> Result<Session> {
        let mut endpoint = Endpoint::resolve(&self.config)
            .await
            .map_err(|e| e.in_phase(HandshakePhase::PreLogin))?;
        let max = self.config.redirect.max_redirects;
        let mut redirects = 0u8;

        loop {
            tracing::info!(
                host = %endpoint.host,
                port = endpoint.port,
                database = ?self.config.database,
                "connecting to SQL Server"
            );
            match self.attempt(&endpoint).await? {
                Attempt::Established(session) => return Ok(session),
                Attempt::Redirect(target) => {
                    if !self.config.redirect.follow_redirects {
                        return Err(Error::Routing {
                            host: target.host,
                            port: target.port,
                        }
                        .in_phase(HandshakePhase::Redirect));
                    }
                    if redirects >= max {
                        return Err(Error::TooManyRedirects { max }.in_phase(HandshakePhase::Redirect));
                    }
                    redirects += 1;
                    tracing::info!(
                        host = %target.host,
                        port = target.port,
                        redirects,
                        max_redirects = max,
                        "following routing redirect"
                    );
                    self.enter(HandshakeState::Disconnected);
                    endpoint = Endpoint {
                        host: target.host,
                        port: target.port,
                    };
                }
            }
        }
    }

    fn enter(&mut self, next: HandshakeState) {
        tracing::debug!(from = ?self.state, to = ?next, "handshake state");
        self.state = next;
    }

    async fn attempt(&mut self, endpoint: &Endpoint) -> Result<Attempt> {
        let (framer, server) = self
            .pre_login(endpoint)
            .await
            .map_err(|e| e.in_phase(HandshakePhase::PreLogin))?;

        let encryption = negotiate_encryption(self.config.encryption, server.encryption)
            .map_err(|e| e.in_phase(HandshakePhase::PreLogin))?;
        let echo = negotiate_fed_auth(self.config.credentials.method().is_federated(), server.fed_auth_required)
            .map_err(|e| e.in_phase(HandshakePhase::PreLogin))?;
        tracing::debug!(
            client = ?self.config.encryption,
            server = ?server.encryption,
            negotiated = ?encryption,
            server_version = %server.version,
            "pre-login negotiated"
        );
        self.enter(HandshakeState::PreLoginReceived);

        let framer = if encryption == Encryption::None {
            framer
        } else {
            self.enter(HandshakeState::TlsHandshake);
            self.upgrade(framer, endpoint)
                .await
                .map_err(|e| e.in_phase(HandshakePhase::Tls))?
        };

        let mut state = SessionState::new(framer.packet_size());
        state.server_version = Some(server.version);
        self.login(framer, state, endpoint, encryption, echo, server.nonce)
            .await
            .map_err(|e| e.in_phase(HandshakePhase::Login))
    }

    async fn pre_login(&mut self, endpoint: &Endpoint) -> Result<(PacketFramer<Transport>, PreLogin)> {
        let connect_timeout = self.config.timeouts.connect_timeout;
        tracing::debug!(host = %endpoint.host, port = endpoint.port, "establishing TCP connection");
        let tcp = tokio::time::timeout(
            connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| Error::Timeout(connect_timeout))??;
        tcp.set_nodelay(true)?;

        let mut framer = PacketFramer::new(Transport::Plain(tcp), DEFAULT_PACKET_SIZE)?;
        let request = self.build_pre_login();
        framer
            .send_message(PacketType::PreLogin, &request.encode())
            .await?;
        self.enter(HandshakeState::PreLoginSent);

        let (packet_type, payload) = framer.read_message().await?;
        if !matches!(packet_type, PacketType::TabularResult | PacketType::PreLogin) {
            return Err(Error::ProtocolViolation(format!(
                "expected a Pre-Login reply, got {packet_type:?}"
            )));
        }
        let server = PreLogin::decode(payload)?;
        Ok((framer, server))
    }

    fn build_pre_login(&self) -> PreLogin {
        let mut prelogin = PreLogin::new()
            .with_encryption(self.config.encryption.level())
            .with_thread_id(std::process::id())
            .with_mars(self.config.mars);
        if let Some(instance) = &self.config.instance {
            prelogin = prelogin.with_instance(instance.clone());
        }
        if self.config.credentials.method().is_federated() {
            prelogin = prelogin.with_fed_auth_required(true);
        }
        prelogin
    }

    async fn upgrade(
        &mut self,
        framer: PacketFramer<Transport>,
        endpoint: &Endpoint,
    ) -> Result<PacketFramer<Transport>> {
        let packet_size = framer.packet_size();
        let tcp = framer.into_inner()?.into_plain();
        let connector = TlsConnector::new(self.config.tls_config()?)?;
        let tls = connector.connect(tcp, &endpoint.host, packet_size).await?;
        Ok(PacketFramer::new(Transport::Tls(Box::new(tls)), packet_size)?)
    }

    async fn login(
        &mut self,
        mut framer: PacketFramer<Transport>,
        mut state: SessionState,
        endpoint: &Endpoint,
        encryption: Encryption,
        echo: bool,
        nonce: Option<[u8; 32]>,
    ) -> Result<Attempt> {
        let mut sspi = self.start_sspi(endpoint)?;
        let mut login = self.build_login7(endpoint, echo, nonce)?;
        if let Some(session) = sspi.as_mut() {
            login = login.with_sspi(session.initial_token().await?);
        }

        framer.send_message(PacketType::Login7, &login.encode()?).await?;
        self.enter(HandshakeState::LoginSent);

        if encryption == Encryption::LoginOnly {
            tracing::debug!("LOGIN7 sent through TLS, switching to plaintext");
            let packet_size = framer.packet_size();
            let tcp = framer.into_inner()?.into_plain();
            framer = PacketFramer::new(Transport::Plain(tcp), packet_size)?;
        }

        let mut decoder = TokenDecoder::new(Arc::clone(&self.registry));
        decoder.set_observer(self.observer.clone());
        decoder.start_response();

        let mut acknowledged = false;
        let mut replied = false;
        loop {
            match decoder.next_event(&mut framer, &mut state).await? {
                Some(ProtocolEvent::LoginAck(ack)) => {
                    tracing::debug!(
                        program = %ack.prog_name,
                        tds_version = ?ack.tds_version,
                        "login acknowledged"
                    );
                    acknowledged = true;
                }
                Some(ProtocolEvent::SspiChallenge(challenge)) => {
                    let session = sspi.as_mut().ok_or_else(|| {
                        Error::ProtocolViolation(
                            "SSPI challenge without integrated authentication".into(),
                        )
                    })?;
                    if let Some(token) = session.next_token(&challenge).await? {
                        tracing::debug!(length = token.len(), "answering SSPI challenge");
                        framer.send_message(PacketType::Sspi, &token).await?;
                        replied = true;
                    }
                }
                Some(ProtocolEvent::FedAuthInfo(info)) => {
                    let Credentials::FedAuth { provider, .. } = &self.config.credentials else {
                        return Err(AuthError::UnsupportedMethod(
                            "the server asked for a federated token".into(),
                        )
                        .into());
                    };
                    let context = FedAuthContext {
                        sts_url: info.sts_url,
                        spn: info.spn,
                    };
                    tracing::debug!(sts_url = %context.sts_url, spn = %context.spn, "fetching federated token");
                    let token = provider.token(&context).await?;
                    framer
                        .send_message(
                            PacketType::FedAuthToken,
                            &encode_fed_auth_token(&token, nonce.as_ref()),
                        )
                        .await?;
                    replied = true;
                }
                Some(ProtocolEvent::EnvironmentChange(env)) => {
                    tracing::trace!(env_type = ?env.env_type, "login environment change");
                }
                Some(_) => {}
                None if acknowledged => break,
                None if replied => {
                    replied = false;
                    decoder.start_response();
                }
                None => {
                    return Err(Error::ProtocolViolation(
                        "login response ended without a login acknowledgement".into(),
                    ));
                }
            }
        }
        self.enter(HandshakeState::LoginAcknowledged);

        if let Some(target) = state.routing.take() {
            return Ok(Attempt::Redirect(target));
        }

        tracing::info!(
            host = %endpoint.host,
            port = endpoint.port,
            packet_size = state.packet_size,
            database = ?state.database,
            "connection established"
        );
        Ok(Attempt::Established(Session::from_parts(
            framer,
            state,
            decoder,
            encryption == Encryption::Full,
            endpoint.host.clone(),
            endpoint.port,
        )))
    }

    fn start_sspi(&self, endpoint: &Endpoint) -> Result<Option<Box<dyn SspiSession>>> {
        let Credentials::Integrated { provider, spn } = &self.config.credentials else {
            return Ok(None);
        };
        let target = SspiTarget {
            spn: spn
                .clone()
                .unwrap_or_else(|| SspiTarget::default_spn(&endpoint.host, endpoint.port)),
            workstation: self.config.workstation.clone(),
        };
        Ok(Some(provider.start(&target)?))
    }

    fn build_login7(&self, endpoint: &Endpoint, echo: bool, nonce: Option<[u8; 32]>) -> Result<Login7> {
        let config = &self.config;
        let mut login = Login7::new()
            .with_packet_size(u32::from(config.packet_size))
            .with_app_name(config.application_name.clone())
            .with_server_name(endpoint.host.clone())
            .with_client_lcid(config.client_lcid)
            .with_read_only_intent(config.read_only_intent);
        login.tds_version = config.tds_version;
        if let Some(workstation) = &config.workstation {
            login = login.with_hostname(workstation.clone());
        }
        if let Some(database) = &config.database {
            login = login.with_database(database.clone());
        }
        if let Some(language) = &config.language {
            login = login.with_language(language.clone());
        }
        if let Credentials::SqlServer { username, password } = &config.credentials {
            login = login.with_sql_auth(username.as_ref(), password.as_ref());
        }
        if let Some(feature) = config.credentials.fed_auth_feature(echo, nonce) {
            let mut features = FeatureExtensions::new();
            features.add_fed_auth(&feature)?;
            login = login.with_features(features);
        }
        Ok(login)
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("host", &self.config.host)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_matrix() {
        use EncryptionLevel as S;
        use EncryptionMode as C;

        assert_eq!(negotiate_encryption(C::Off, S::Off).unwrap(), Encryption::LoginOnly);
        assert_eq!(negotiate_encryption(C::Off, S::On).unwrap(), Encryption::Full);
        assert_eq!(negotiate_encryption(C::Off, S::Required).unwrap(), Encryption::Full);
        assert_eq!(negotiate_encryption(C::Off, S::NotSupported).unwrap(), Encryption::None);
        assert_eq!(negotiate_encryption(C::On, S::On).unwrap(), Encryption::Full);
        assert_eq!(negotiate_encryption(C::On, S::Required).unwrap(), Encryption::Full);
        assert_eq!(negotiate_encryption(C::NotSupported, S::Off).unwrap(), Encryption::None);
        assert_eq!(
            negotiate_encryption(C::NotSupported, S::NotSupported).unwrap(),
            Encryption::None
        );
    }

    #[test]
    fn test_encryption_fails_closed() {
        use EncryptionLevel as S;
        use EncryptionMode as C;

        for (client, server) in [
            (C::On, S::Off),
            (C::On, S::NotSupported),
            (C::NotSupported, S::On),
            (C::NotSupported, S::Required),
        ] {
            assert!(matches!(
                negotiate_encryption(client, server),
                Err(Error::Negotiation(_))
            ));
        }
    }

    #[test]
    fn test_fed_auth_negotiation() {
        assert!(negotiate_fed_auth(true, Some(true)).unwrap());
        assert!(!negotiate_fed_auth(true, Some(false)).unwrap());
        assert!(!negotiate_fed_auth(false, None).unwrap());
        assert!(!negotiate_fed_auth(false, Some(false)).unwrap());
        assert!(matches!(negotiate_fed_auth(true, None), Err(Error::Negotiation(_))));
        assert!(matches!(
            negotiate_fed_auth(false, Some(true)),
            Err(Error::Negotiation(_))
        ));
    }

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "db.example.com".into(),
            port: 1433,
        }
    }

    #[test]
    fn test_login7_sql_auth() {
        let config = Config::new()
            .host("db.example.com")
            .credentials(Credentials::sql_server("app", "s3cret"))
            .database("orders")
            .packet_size(8192);
        let login = Handshake::new(config).build_login7(&endpoint(), false, None).unwrap();
        assert_eq!(login.username, "app");
        assert_eq!(login.password, "s3cret");
        assert_eq!(login.database, "orders");
        assert_eq!(login.server_name, "db.example.com");
        assert_eq!(login.packet_size, 8192);
        assert!(login.features.is_empty());
    }

    #[test]
    fn test_login7_access_token_feature() {
        let config = Config::new().credentials(Credentials::access_token("eyJ0"));
        let login = Handshake::new(config)
            .build_login7(&endpoint(), true, Some([3u8; 32]))
            .unwrap();
        assert!(login.username.is_empty());
        assert!(
            login
                .features
                .get(tds_protocol::feature_ext::FeatureId::FedAuth as u8)
                .is_some()
        );
    }

    #[test]
    fn test_pre_login_requests_fed_auth() {
        let config = Config::new().credentials(Credentials::access_token("t"));
        let prelogin = Handshake::new(config).build_pre_login();
        assert_eq!(prelogin.fed_auth_required, Some(true));
        assert_eq!(prelogin.encryption, EncryptionLevel::On);

        let plain = Handshake::new(Config::new().encryption(EncryptionMode::NotSupported))
            .build_pre_login();
        assert_eq!(plain.fed_auth_required, None);
        assert_eq!(plain.encryption, EncryptionLevel::NotSupported);
    }

    #[tokio::test]
    async fn test_endpoint_prefers_explicit_port() {
        let config = Config::new().host("h").port(1500).instance("SQLEXPRESS");
        assert_eq!(Endpoint::resolve(&config).await.unwrap().port, 1500);
        assert_eq!(Endpoint::resolve(&Config::new()).await.unwrap().port, DEFAULT_PORT);
    }
}
