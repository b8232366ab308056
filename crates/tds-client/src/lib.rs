//! # tds-client
//!
//! Session core of a TDS (SQL Server wire protocol) client.
//!
//! This crate turns a TCP connection into an authenticated [`Session`] and
//! decodes the server's token stream into [`ProtocolEvent`]s. SQL semantics,
//! pooling and retries belong to the layers above.
//!
//! ## Connecting
//!
//! [`Handshake`] runs Pre-Login negotiation, the optional TLS handshake
//! tunnelled through Pre-Login packets, LOGIN7 with one of the
//! [`Credentials`] branches, and the post-login token loop. Routing
//! redirects restart it against the routed server, a bounded number of times.
//!
//! ```text
//! Disconnected -> PreLoginSent -> PreLoginReceived -> [TlsHandshake]
//!              -> LoginSent -> LoginAcknowledged
//!                     ^                |
//!                     +--- Redirect ---+
//! ```
//!
//! Failures are reported as [`Error::Handshake`], naming the phase that
//! failed.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_client::{Config, Credentials, ProtocolEvent, Session};
//!
//! let config = Config::new()
//!     .host("db.example.com")
//!     .credentials(Credentials::sql_server("app", "secret"))
//!     .database("orders");
//!
//! let mut session = Session::connect(config).await?;
//! session.send_sql_batch("SELECT id, name FROM customers").await?;
//! while let Some(event) = session.next_event().await? {
//!     if let Some(row) = event.as_row() {
//!         println!("{row:?}");
//!     }
//! }
//! session.close().await?;
//! ```
//!
//! ## Token decoding
//!
//! [`TokenDecoder`] is pull-based and driven by the caller's task. Session
//! state carried in ENVCHANGE tokens (database, transaction, packet size,
//! routing) is applied before the event is returned, so a new packet size
//! is already in effect for the next read.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod browser;
pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod handshake;
pub mod session;
pub mod state;
mod transport;

pub use config::{Config, EncryptionMode, RedirectConfig, TimeoutConfig};
pub use decoder::{MessageObserver, TokenDecoder};
pub use dispatch::{DispatchTable, LengthPrefix, TokenKind};
pub use error::{Error, HandshakePhase, Result};
pub use event::{ColumnDescriptor, ColumnFlags, ProtocolEvent, ReturnValue};
pub use handshake::{Encryption, Handshake, HandshakeState};
pub use session::{CancelHandle, Session};
pub use state::{ResponseState, SessionState};

pub use tds_auth::Credentials;
pub use tds_protocol::packet::PacketType;
pub use tds_types::{TypeRegistry, Value};
