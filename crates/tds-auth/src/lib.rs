//! # tds-auth
//!
//! Credentials and authentication providers for the TDS login sequence.
//!
//! | Credentials | LOGIN7 carries | Follow-up exchange |
//! |-------------|----------------|--------------------|
//! | `SqlServer` | user name and obfuscated password | none |
//! | `Integrated` | first SSPI blob | SSPI tokens until the provider is done |
//! | `AccessToken` | FEDAUTH feature with the token | none |
//! | `FedAuth` | FEDAUTH feature (ADAL workflow) | FedAuthInfo → token message |
//!
//! Mechanism-specific work (Kerberos, NTLM, token acquisition) lives behind
//! [`SspiProvider`] and [`FedAuthTokenProvider`] so this crate stays free of
//! platform security libraries.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod credentials;
pub mod error;
pub mod provider;

pub use credentials::{AuthMethod, Credentials};
pub use error::AuthError;
pub use provider::{FedAuthContext, FedAuthTokenProvider, SspiProvider, SspiSession, SspiTarget};
pub use tds_protocol::feature_ext::AdalWorkflow;
