//! # tds-testing
//!
//! Test infrastructure for the TDS session core.
//!
//! ## Features
//!
//! - Mock TDS server covering Pre-Login, in-band TLS, every login branch,
//!   routing and attention (no SQL Server required)
//! - Token stream builder for feeding decoders hand-made replies
//! - Self-signed TLS identities for encrypted test connections
//!
//! ## Mock Server Example
//!
//! ```rust,ignore
//! use tds_testing::{MockResponse, MockTdsServer};
//! use tds_protocol::prelogin::EncryptionLevel;
//!
//! #[tokio::test]
//! async fn test_encrypted_login() {
//!     let server = MockTdsServer::builder()
//!         .with_encryption(EncryptionLevel::Required)
//!         .with_response("SELECT 1", MockResponse::rows_affected(1))
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     // Connect a client to server.host():server.port() with
//!     // trust_server_certificate, or trust server.certificate().
//! }
//! ```
//!
//! ## Token Stream Example
//!
//! ```rust,ignore
//! use tds_testing::TokenStreamBuilder;
//! use tds_protocol::token::DoneStatus;
//!
//! let reply = TokenStreamBuilder::new()
//!     .info(5701, "Changed database context to 'orders'.")
//!     .done(DoneStatus::empty(), 0)
//!     .build()?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock_server;
pub mod tls;
pub mod tokens;

pub use mock_server::{
    MockResponse, MockServerBuilder, MockServerConfig, MockServerError, MockTdsServer, Recorded,
};
pub use tls::TlsIdentity;
pub use tokens::TokenStreamBuilder;
