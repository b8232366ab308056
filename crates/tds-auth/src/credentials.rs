//! Credential types for authentication.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use tds_protocol::feature_ext::{AdalWorkflow, FedAuthFeature};

use crate::provider::{FedAuthTokenProvider, SspiProvider};

/// Authentication method, without the secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// SQL Server login and password in LOGIN7.
    SqlServer,
    /// Integrated authentication over SSPI tokens.
    Integrated,
    /// Pre-acquired federated access token.
    AccessToken,
    /// Federated token fetched after the server sends FedAuthInfo.
    FedAuth,
}

impl AuthMethod {
    /// Check if this method uses federated authentication.
    #[must_use]
    pub fn is_federated(&self) -> bool {
        matches!(self, Self::AccessToken | Self::FedAuth)
    }
}

/// Credentials for the login sequence.
#[derive(Clone)]
pub enum Credentials {
    /// SQL Server authentication with username and password.
    SqlServer {
        /// Username.
        username: Cow<'static, str>,
        /// Password.
        password: Cow<'static, str>,
    },

    /// Integrated authentication through an SSPI provider.
    Integrated {
        /// Produces the SSPI exchange for each connection attempt.
        provider: Arc<dyn SspiProvider>,
        /// Explicit SPN; derived from host and port when absent.
        spn: Option<String>,
    },

    /// Federated access token the caller already holds.
    AccessToken {
        /// The access token string.
        token: Cow<'static, str>,
    },

    /// Federated authentication with a token fetched on demand.
    FedAuth {
        /// Workflow announced to the server.
        workflow: AdalWorkflow,
        /// Fetches the token once the server names its STS and SPN.
        provider: Arc<dyn FedAuthTokenProvider>,
    },
}

impl Credentials {
    /// SQL Server credentials.
    pub fn sql_server(
        username: impl Into<Cow<'static, str>>,
        password: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::SqlServer {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Integrated authentication with the default SPN.
    pub fn integrated(provider: Arc<dyn SspiProvider>) -> Self {
        Self::Integrated {
            provider,
            spn: None,
        }
    }

    /// Pre-acquired federated access token.
    pub fn access_token(token: impl Into<Cow<'static, str>>) -> Self {
        Self::AccessToken {
            token: token.into(),
        }
    }

    /// Federated authentication with an on-demand token provider.
    pub fn fed_auth(workflow: AdalWorkflow, provider: Arc<dyn FedAuthTokenProvider>) -> Self {
        Self::FedAuth { workflow, provider }
    }

    /// Method these credentials use.
    #[must_use]
    pub fn method(&self) -> AuthMethod {
        match self {
            Self::SqlServer { .. } => AuthMethod::SqlServer,
            Self::Integrated { .. } => AuthMethod::Integrated,
            Self::AccessToken { .. } => AuthMethod::AccessToken,
            Self::FedAuth { .. } => AuthMethod::FedAuth,
        }
    }

    /// FEDAUTH feature extension for LOGIN7, if these credentials need one.
    ///
    /// `echo` reflects the server's Pre-Login FEDAUTHREQUIRED option and
    /// `nonce` its Pre-Login nonce, which is echoed with a held token.
    #[must_use]
    pub fn fed_auth_feature(&self, echo: bool, nonce: Option<[u8; 32]>) -> Option<FedAuthFeature> {
        match self {
            Self::AccessToken { token } => {
                let mut feature = FedAuthFeature::security_token(token.as_ref()).with_echo(echo);
                feature.nonce = nonce;
                Some(feature)
            }
            Self::FedAuth { workflow, .. } => {
                Some(FedAuthFeature::adal(*workflow).with_echo(echo))
            }
            Self::SqlServer { .. } | Self::Integrated { .. } => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SqlServer { username, .. } => f
                .debug_struct("SqlServer")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::Integrated { spn, .. } => f
                .debug_struct("Integrated")
                .field("spn", spn)
                .finish_non_exhaustive(),
            Self::AccessToken { .. } => f
                .debug_struct("AccessToken")
                .field("token", &"[REDACTED]")
                .finish(),
            Self::FedAuth { workflow, .. } => f
                .debug_struct("FedAuth")
                .field("workflow", workflow)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::feature_ext::FedAuthLibrary;

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::sql_server("sa", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("sa"));
        assert!(!rendered.contains("hunter2"));

        let token = Credentials::access_token("eyJ0eXAi");
        assert!(!format!("{token:?}").contains("eyJ0eXAi"));
    }

    #[test]
    fn test_access_token_feature_echoes_nonce() {
        let nonce = [7u8; 32];
        let feature = Credentials::access_token("tok")
            .fed_auth_feature(true, Some(nonce))
            .unwrap();
        assert_eq!(feature.library, FedAuthLibrary::SecurityToken);
        assert!(feature.echo);
        assert_eq!(feature.nonce, Some(nonce));
        assert_eq!(feature.token, "tok");
    }

    #[test]
    fn test_sql_auth_has_no_feature() {
        let creds = Credentials::sql_server("sa", "pw");
        assert_eq!(creds.method(), AuthMethod::SqlServer);
        assert!(creds.fed_auth_feature(true, None).is_none());
        assert!(!creds.method().is_federated());
    }
}
