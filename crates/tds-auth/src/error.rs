//! Authentication error types.

use thiserror::Error;

/// Errors raised by credential handling and authentication providers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Invalid credentials provided.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Token acquisition failed.
    #[error("failed to acquire token: {0}")]
    TokenAcquisition(String),

    /// SSPI/GSSAPI error.
    #[error("SSPI error: {0}")]
    Sspi(String),

    /// The server asked for a step the credentials cannot perform.
    #[error("unsupported authentication step: {0}")]
    UnsupportedMethod(String),
}
