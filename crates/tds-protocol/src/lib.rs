//! # tds-protocol
//!
//! Wire formats of the MS-TDS (Tabular Data Stream) protocol spoken by
//! Microsoft SQL Server.
//!
//! This crate holds packet headers, the Pre-Login and LOGIN7 records, the
//! feature extension block, SQL batch payloads and the self-contained token
//! records. Everything here works on in-memory buffers.
//!
//! ## Design Philosophy
//!
//! This crate is intentionally IO-agnostic. It contains no networking logic and
//! makes no assumptions about the async runtime. `tds-framer` adds packet
//! framing over an async transport and `tds-client` drives the handshake.
//!
//! ## Byte order
//!
//! Multi-byte integers are little-endian, with two exceptions kept exactly
//! as the protocol defines them: the packet header's length and SPID, and
//! the TDS version inside LOGINACK, are big-endian.
//!
//! ## Example
//!
//! ```rust
//! use tds_protocol::{PacketHeader, PacketStatus, PacketType};
//!
//! let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 100);
//! let bytes = header.encode_to_bytes();
//! assert_eq!(&bytes[..4], &[0x01, 0x01, 0x00, 100]);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod error;
pub mod feature_ext;
pub mod login7;
pub mod packet;
pub mod prelogin;
pub mod sql_batch;
pub mod token;
pub mod version;

pub use error::ProtocolError;
pub use feature_ext::{
    AdalWorkflow, FeatureExtensions, FeatureId, FedAuthFeature, FedAuthLibrary,
    decode_fed_auth_token, encode_fed_auth_token,
};
pub use login7::{Login7, OptionFlags1, OptionFlags2, OptionFlags3, TypeFlags};
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_NEGOTIATED_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE,
    PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType, check_declared_length,
    clamp_packet_size,
};
pub use prelogin::{EncryptionLevel, PreLogin, PreLoginOption, TraceId};
pub use sql_batch::{AllHeaders, SqlBatch};
pub use token::{
    Collation, Done, DoneStatus, EnvChange, EnvChangeType, EnvChangeValue, FeatureExtAck,
    FedAuthInfo, LoginAck, NO_METADATA, Order, RoutingTarget, ServerMessage, TokenType,
};
pub use version::{SqlServerVersion, TdsVersion};
