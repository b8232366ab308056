//! Client error types.

use std::fmt;
use std::io;
use std::time::Duration;

use tds_auth::AuthError;
use tds_framer::FramerError;
use tds_protocol::ProtocolError;
use tds_protocol::token::ServerMessage;
use tds_tls::TlsError;
use tds_types::TypeError;
use thiserror::Error;

/// Connection-establishment phase an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakePhase {
    /// TCP dial and Pre-Login exchange.
    PreLogin,
    /// In-band TLS handshake.
    Tls,
    /// LOGIN7 and the post-login token loop.
    Login,
    /// Following a server routing redirect.
    Redirect,
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PreLogin => "pre-login",
            Self::Tls => "TLS handshake",
            Self::Login => "login",
            Self::Redirect => "redirect",
        })
    }
}

/// Errors that can occur while establishing or using a session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Socket I/O failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// TLS failed; part of the transport category.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A packet header is inconsistent with the stream.
    #[error("malformed packet: {0}")]
    MalformedPacket(#[source] FramerError),

    /// Client and server capabilities do not match.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The server sent something the protocol does not allow here.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server rejected a request.
    #[error("server error {number}: {message}")]
    Server {
        /// Error number.
        number: i32,
        /// Error state.
        state: u8,
        /// Severity class (0-25).
        class: u8,
        /// Error message.
        message: String,
        /// Server name.
        server: Option<String>,
        /// Stored procedure name.
        procedure: Option<String>,
        /// Line number in the batch or procedure.
        line: u32,
    },

    /// The server routed the connection and redirects are disabled.
    #[error("server routed the connection to {host}:{port}")]
    Routing {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },

    /// The redirect bound was exceeded.
    #[error("too many redirects (max {max})")]
    TooManyRedirects {
        /// Configured maximum.
        max: u8,
    },

    /// A one-shot connect or login timeout elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An authentication provider failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// A column or parameter value could not be decoded.
    #[error("type error: {0}")]
    Type(TypeError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection establishment failed in `phase`.
    #[error("{phase} failed: {source}")]
    Handshake {
        /// Phase that failed.
        phase: HandshakePhase,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Build a server error from an ERROR token.
    #[must_use]
    pub fn from_server_message(msg: &ServerMessage) -> Self {
        Self::Server {
            number: msg.number,
            state: msg.state,
            class: msg.class,
            message: msg.message.clone(),
            server: (!msg.server.is_empty()).then(|| msg.server.clone()),
            procedure: (!msg.procedure.is_empty()).then(|| msg.procedure.clone()),
            line: u32::try_from(msg.line).unwrap_or_default(),
        }
    }

    /// Attribute this error to a handshake phase.
    ///
    /// Errors already attributed keep their original phase.
    #[must_use]
    pub fn in_phase(self, phase: HandshakePhase) -> Self {
        match self {
            Self::Handshake { .. } | Self::Timeout(_) => self,
            other => Self::Handshake {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// Handshake phase, if this is a connection-establishment failure.
    #[must_use]
    pub fn phase(&self) -> Option<HandshakePhase> {
        match self {
            Self::Handshake { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// The error with any phase attribution peeled off.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Handshake { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if retrying on a fresh connection could succeed.
    ///
    /// Retrying is the caller's business; nothing in this crate retries.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self.root() {
            Self::Transport(_) | Self::ConnectionClosed | Self::Timeout(_) | Self::Routing { .. } => {
                true
            }
            // Deadlock victim, and the Azure "service busy" family.
            Self::Server { number, .. } => {
                matches!(number, 1205 | 4060 | 40197 | 40501 | 40613 | 49918 | 49919 | 49920)
            }
            _ => false,
        }
    }

    /// Check if the session is unusable after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self.root() {
            Self::Server { class, .. } => *class >= 20,
            Self::Auth(_) | Self::Type(_) | Self::Config(_) => false,
            _ => true,
        }
    }

    /// Check if this is a server error with a specific number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        matches!(self.root(), Self::Server { number: n, .. } if *n == number)
    }

    /// Severity class of a server error.
    ///
    /// - 0-10: informational
    /// - 11-16: user errors
    /// - 17-19: resource and software errors
    /// - 20-25: fatal, the connection is closed
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        match self.root() {
            Self::Server { class, .. } => Some(*class),
            _ => None,
        }
    }
}

impl From<FramerError> for Error {
    fn from(err: FramerError) -> Self {
        match err {
            FramerError::Io(err) => Self::Transport(err),
            FramerError::ConnectionClosed => Self::ConnectionClosed,
            err @ (FramerError::Malformed(_) | FramerError::TruncatedMessage) => {
                Self::MalformedPacket(err)
            }
            other => Self::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::PacketLengthTooSmall(_)
            | ProtocolError::PacketLengthTooLarge { .. }
            | ProtocolError::InvalidPacketType(_)
            | ProtocolError::InvalidPacketStatus(_) => Self::MalformedPacket(err.into()),
            other => Self::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        match err {
            TypeError::Io(err) => FramerError::from_io(err).into(),
            other => Self::Type(other),
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn server(number: i32, class: u8) -> Error {
        Error::Server {
            number,
            state: 1,
            class,
            message: "boom".into(),
            server: None,
            procedure: None,
            line: 1,
        }
    }

    #[test]
    fn test_phase_wraps_once() {
        let err = Error::Negotiation("no".into())
            .in_phase(HandshakePhase::PreLogin)
            .in_phase(HandshakePhase::Login);
        assert_eq!(err.phase(), Some(HandshakePhase::PreLogin));
        assert!(matches!(err.root(), Error::Negotiation(_)));
        assert_eq!(err.to_string(), "pre-login failed: negotiation failed: no");
    }

    #[test]
    fn test_server_error_helpers_see_through_phase() {
        let err = server(18456, 14).in_phase(HandshakePhase::Login);
        assert!(err.is_server_error(18456));
        assert_eq!(err.class(), Some(14));
        assert!(!err.is_transient());
        assert!(!err.is_fatal());
        assert!(server(0, 20).is_fatal());
        assert!(server(1205, 13).is_transient());
    }

    #[test]
    fn test_framer_errors_map_to_taxonomy() {
        let malformed: Error = FramerError::Malformed(ProtocolError::PacketLengthTooSmall(4)).into();
        assert!(matches!(malformed, Error::MalformedPacket(_)));

        let truncated: Error = FramerError::TruncatedMessage.into();
        assert!(matches!(truncated, Error::MalformedPacket(_)));

        let io: Error = FramerError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).into();
        assert!(matches!(io, Error::Transport(_)));
        assert!(io.is_transient());
    }

    #[test]
    fn test_unknown_env_change_is_violation() {
        let err: Error = ProtocolError::UnknownEnvChange(99).into();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_from_server_message_drops_empty_names() {
        let msg = ServerMessage {
            number: 547,
            state: 0,
            class: 16,
            message: "constraint".into(),
            server: "db1".into(),
            procedure: String::new(),
            line: 3,
        };
        match Error::from_server_message(&msg) {
            Error::Server {
                number,
                server,
                procedure,
                line,
                ..
            } => {
                assert_eq!(number, 547);
                assert_eq!(server.as_deref(), Some("db1"));
                assert!(procedure.is_none());
                assert_eq!(line, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
