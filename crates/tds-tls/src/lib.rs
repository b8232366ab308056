//! # tds-tls
//!
//! In-band TLS for TDS connections.
//!
//! SQL Server negotiates encryption in the PreLogin exchange and then runs
//! the TLS handshake on the same socket, with every handshake record wrapped
//! in a PreLogin packet:
//!
//! ```text
//! TCP connect → PreLogin (cleartext) → TLS handshake in PreLogin packets → LOGIN7 (encrypted)
//! ```
//!
//! [`PreLoginTunnel`] does the wrapping. [`TlsConnector`] drives rustls over
//! it and switches the tunnel to pass-through once the handshake finishes,
//! leaving a TLS stream the packet framer can sit on.
//!
//! ## Security
//!
//! Server certificates are validated against the Mozilla root store unless
//! custom roots are configured. `trust_server_certificate` disables
//! validation and logs a warning.
//!
//! ```rust,ignore
//! use tds_tls::{TlsConfig, TlsConnector};
//!
//! let connector = TlsConnector::new(TlsConfig::new().with_ca_file("ca.pem")?)?;
//! let tls = connector.connect(tcp, "sql.example.com", 4096).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod error;
pub mod tunnel;

pub use config::{TlsConfig, TlsVersion};
pub use connector::TlsConnector;
pub use error::TlsError;
pub use tunnel::PreLoginTunnel;

pub use tokio_rustls::client::TlsStream;
