//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use tds_auth::Credentials;
use tds_protocol::packet::{DEFAULT_PACKET_SIZE, clamp_packet_size};
use tds_protocol::prelogin::EncryptionLevel;
use tds_protocol::version::TdsVersion;
use tds_tls::TlsConfig;

use crate::error::{Error, Result};

/// Default SQL Server port.
pub const DEFAULT_PORT: u16 = 1433;

/// Client encryption policy, announced in Pre-Login.
///
/// A connection-level `encrypt=false` maps to [`EncryptionMode::NotSupported`]:
/// no TLS handshake is attempted when the server answers Off or NotSupported.
/// [`EncryptionMode::Off`] still runs TLS for the login packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionMode {
    /// No TLS at all. Fails if the server insists on encryption.
    NotSupported,
    /// Encrypt the login only, unless the server asks for more.
    Off,
    /// Encrypt the whole session. Fails closed if the server cannot.
    #[default]
    On,
}

impl EncryptionMode {
    /// Pre-Login encryption byte for this policy.
    #[must_use]
    pub fn level(self) -> EncryptionLevel {
        match self {
            Self::NotSupported => EncryptionLevel::NotSupported,
            Self::Off => EncryptionLevel::Off,
            Self::On => EncryptionLevel::On,
        }
    }
}

/// Server-directed redirect handling.
#[derive(Debug, Clone)]
pub struct RedirectConfig {
    /// Maximum number of redirects followed per connect (default: 2).
    pub max_redirects: u8,
    /// Whether to follow redirects automatically (default: true).
    pub follow_redirects: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            max_redirects: 2,
            follow_redirects: true,
        }
    }
}

impl RedirectConfig {
    /// Create a new redirect configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of redirects.
    #[must_use]
    pub fn max_redirects(mut self, max: u8) -> Self {
        self.max_redirects = max;
        self
    }

    /// Enable or disable automatic redirect following.
    #[must_use]
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Disable redirect following.
    ///
    /// A routing record then fails the connect with [`Error::Routing`].
    #[must_use]
    pub fn no_follow() -> Self {
        Self {
            max_redirects: 0,
            follow_redirects: false,
        }
    }
}

/// One-shot timeouts around connection establishment.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Time to establish each TCP connection (default: 15s).
    pub connect_timeout: Duration,
    /// Time for the whole handshake, redirects included (default: 30s).
    pub login_timeout: Duration,
    /// Time to wait for a SQL Browser reply (default: 2s).
    pub browser_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            login_timeout: Duration::from_secs(30),
            browser_timeout: Duration::from_secs(2),
        }
    }
}

impl TimeoutConfig {
    /// Create a new timeout configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TCP connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the overall login timeout.
    #[must_use]
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Set the SQL Browser timeout.
    #[must_use]
    pub fn browser_timeout(mut self, timeout: Duration) -> Self {
        self.browser_timeout = timeout;
        self
    }
}

/// Connection parameters.
///
/// Built by the caller; parsing connection strings is left to outer layers.
///
/// ```rust,ignore
/// let config = Config::new()
///     .host("db.example.com")
///     .database("orders")
///     .credentials(Credentials::sql_server("app", "secret"))
///     .encryption(EncryptionMode::On);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Server host name or address.
    pub host: String,

    /// Explicit TCP port.
    ///
    /// When unset, a named instance is resolved through SQL Browser and
    /// everything else uses [`DEFAULT_PORT`].
    pub port: Option<u16>,

    /// Named instance.
    pub instance: Option<String>,

    /// Authentication credentials.
    pub credentials: Credentials,

    /// Initial database.
    pub database: Option<String>,

    /// Application name reported to the server.
    pub application_name: String,

    /// Client workstation name.
    pub workstation: Option<String>,

    /// Initial language.
    pub language: Option<String>,

    /// Client locale id.
    pub client_lcid: u32,

    /// Packet size requested in LOGIN7.
    pub packet_size: u16,

    /// Encryption policy.
    pub encryption: EncryptionMode,

    /// Accept any server certificate.
    pub trust_server_certificate: bool,

    /// Host name expected in the server certificate, overriding the
    /// connected (or routed) host.
    pub host_in_certificate: Option<String>,

    /// Extra CA certificate file (PEM or DER).
    pub ca_file: Option<PathBuf>,

    /// Request Multiple Active Result Sets.
    pub mars: bool,

    /// Declare read-only application intent.
    pub read_only_intent: bool,

    /// TDS version requested in LOGIN7.
    pub tds_version: TdsVersion,

    /// Timeouts.
    pub timeouts: TimeoutConfig,

    /// Redirect handling.
    pub redirect: RedirectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            instance: None,
            credentials: Credentials::sql_server("", ""),
            database: None,
            application_name: "tds-client".to_string(),
            workstation: None,
            language: None,
            client_lcid: 0x0409,
            packet_size: DEFAULT_PACKET_SIZE as u16,
            encryption: EncryptionMode::default(),
            trust_server_certificate: false,
            host_in_certificate: None,
            ca_file: None,
            mars: false,
            read_only_intent: false,
            tds_version: TdsVersion::V7_4,
            timeouts: TimeoutConfig::default(),
            redirect: RedirectConfig::default(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set an explicit port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the named instance.
    #[must_use]
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the workstation name.
    #[must_use]
    pub fn workstation(mut self, name: impl Into<String>) -> Self {
        self.workstation = Some(name.into());
        self
    }

    /// Set the initial language.
    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Set the client locale id.
    #[must_use]
    pub fn client_lcid(mut self, lcid: u32) -> Self {
        self.client_lcid = lcid;
        self
    }

    /// Set the requested packet size, clamped to the protocol range.
    #[must_use]
    pub fn packet_size(mut self, size: u16) -> Self {
        self.packet_size = clamp_packet_size(usize::from(size)) as u16;
        self
    }

    /// Set the encryption policy.
    #[must_use]
    pub fn encryption(mut self, mode: EncryptionMode) -> Self {
        self.encryption = mode;
        self
    }

    /// Trust the server certificate without validation.
    ///
    /// **Warning:** only for development and testing.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Pin the host name expected in the server certificate.
    #[must_use]
    pub fn host_in_certificate(mut self, host: impl Into<String>) -> Self {
        self.host_in_certificate = Some(host.into());
        self
    }

    /// Trust an extra CA certificate file.
    #[must_use]
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Request MARS.
    #[must_use]
    pub fn mars(mut self, enabled: bool) -> Self {
        self.mars = enabled;
        self
    }

    /// Declare read-only application intent.
    #[must_use]
    pub fn read_only_intent(mut self, read_only: bool) -> Self {
        self.read_only_intent = read_only;
        self
    }

    /// Set the TDS version requested in LOGIN7.
    #[must_use]
    pub fn tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = version;
        self
    }

    /// Set the timeouts.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the redirect handling.
    #[must_use]
    pub fn redirect(mut self, redirect: RedirectConfig) -> Self {
        self.redirect = redirect;
        self
    }

    /// Set the maximum number of redirects.
    #[must_use]
    pub fn max_redirects(mut self, max: u8) -> Self {
        self.redirect.max_redirects = max;
        self
    }

    /// Check the configuration before dialing.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.instance.as_deref().is_some_and(|i| i.is_empty()) {
            return Err(Error::Config("instance name must not be empty".into()));
        }
        if self.credentials.method().is_federated() && self.encryption == EncryptionMode::NotSupported {
            return Err(Error::Config(
                "federated authentication requires encryption".into(),
            ));
        }
        Ok(())
    }

    /// TLS settings for the in-band handshake.
    pub fn tls_config(&self) -> Result<TlsConfig> {
        let mut tls = TlsConfig::new().trust_server_certificate(self.trust_server_certificate);
        if let Some(path) = &self.ca_file {
            tls = tls.with_ca_file(path)?;
        }
        if let Some(host) = &self.host_in_certificate {
            tls = tls.with_server_name(host.clone());
        }
        Ok(tls)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.port, None);
        assert_eq!(config.packet_size, 4096);
        assert_eq!(config.encryption, EncryptionMode::On);
        assert_eq!(config.redirect.max_redirects, 2);
        assert!(config.redirect.follow_redirects);
        assert_eq!(config.timeouts.login_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_packet_size_is_clamped() {
        assert_eq!(Config::new().packet_size(100).packet_size, 512);
        assert_eq!(Config::new().packet_size(u16::MAX).packet_size, 32767);
        assert_eq!(Config::new().packet_size(8192).packet_size, 8192);
    }

    #[test]
    fn test_encryption_levels() {
        assert_eq!(EncryptionMode::NotSupported.level(), EncryptionLevel::NotSupported);
        assert_eq!(EncryptionMode::Off.level(), EncryptionLevel::Off);
        assert_eq!(EncryptionMode::On.level(), EncryptionLevel::On);
    }

    #[test]
    fn test_redirect_no_follow() {
        let redirect = RedirectConfig::no_follow();
        assert_eq!(redirect.max_redirects, 0);
        assert!(!redirect.follow_redirects);
        assert_eq!(Config::new().max_redirects(5).redirect.max_redirects, 5);
    }

    #[test]
    fn test_validate() {
        assert!(Config::new().validate().is_ok());
        assert!(matches!(Config::new().host(" ").validate(), Err(Error::Config(_))));
        let federated = Config::new()
            .credentials(Credentials::access_token("tok"))
            .encryption(EncryptionMode::NotSupported);
        assert!(matches!(federated.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_tls_config_pins_certificate_host() {
        let tls = Config::new()
            .trust_server_certificate(true)
            .host_in_certificate("db.internal")
            .tls_config()
            .unwrap();
        assert!(tls.trust_server_certificate);
        assert_eq!(tls.server_name.as_deref(), Some("db.internal"));
    }

    #[test]
    fn test_missing_ca_file_is_reported() {
        let err = Config::new().ca_file("/nonexistent/ca.pem").tls_config().unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }
}
