//! Authentication provider traits.
//!
//! Integrated (SSPI) and ADAL-style federated logins both need something
//! outside the protocol: a security package producing SSPI blobs, or an
//! identity client producing access tokens. The login sequencer drives these
//! through the traits below and never sees the mechanism behind them.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::AuthError;

/// Target of an integrated-authentication exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SspiTarget {
    /// Service principal name, e.g. `MSSQLSvc/db.example.com:1433`.
    pub spn: String,
    /// Workstation name sent with the login.
    pub workstation: Option<String>,
}

impl SspiTarget {
    /// Default SPN for a SQL Server endpoint.
    #[must_use]
    pub fn default_spn(host: &str, port: u16) -> String {
        format!("MSSQLSvc/{host}:{port}")
    }
}

/// Factory for per-connection SSPI exchanges.
pub trait SspiProvider: Send + Sync {
    /// Start an exchange against `target`.
    fn start(&self, target: &SspiTarget) -> Result<Box<dyn SspiSession>, AuthError>;
}

/// One SSPI exchange, from the first blob to completion.
#[async_trait]
pub trait SspiSession: Send {
    /// Blob carried in LOGIN7.
    async fn initial_token(&mut self) -> Result<Bytes, AuthError>;

    /// Answer a server challenge from an SSPI token.
    ///
    /// `None` means the client side is complete and nothing is sent back.
    async fn next_token(&mut self, challenge: &[u8]) -> Result<Option<Bytes>, AuthError>;
}

/// What the server said about where to get a federated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FedAuthContext {
    /// Security token service URL.
    pub sts_url: String,
    /// Service principal name of the server.
    pub spn: String,
}

/// Source of federated-authentication access tokens.
#[async_trait]
pub trait FedAuthTokenProvider: Send + Sync {
    /// Acquire a token for the server described by `context`.
    async fn token(&self, context: &FedAuthContext) -> Result<String, AuthError>;
}
