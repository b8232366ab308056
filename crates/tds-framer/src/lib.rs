//! # tds-framer
//!
//! Async framing layer for TDS packets.
//!
//! TDS carries every message as one or more packets, each with an 8-byte
//! header. This crate hides those boundaries in both directions:
//!
//! - [`PacketWriter`] buffers message bytes and cuts them into packets of the
//!   negotiated size, flagging the last one END_OF_MESSAGE.
//! - [`MessageReader`] exposes the payload of one message as an
//!   [`AsyncRead`](tokio::io::AsyncRead) that fetches continuation packets on
//!   demand and reports end-of-message as end-of-stream.
//! - [`PacketFramer`] splits a transport into both halves and hands out
//!   [`AttentionHandle`]s for cancellation.
//!
//! ## Architecture
//!
//! ```text
//! transport → TdsCodec (packet framing) → MessageReader → token decoder
//! request   → PacketWriter → TdsCodec → transport
//! ```
//!
//! ## Malformed input
//!
//! A header whose length is smaller than the header itself, larger than the
//! current packet size, or a stream that ends mid-packet, is reported as
//! [`FramerError::Malformed`] or [`FramerError::TruncatedMessage`]. Nothing
//! is truncated or retried.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod error;
pub mod framer;
pub mod reader;
pub mod writer;

pub use codec::{Packet, TdsCodec};
pub use error::FramerError;
pub use framer::{AttentionHandle, PacketFramer, validate_packet_size};
pub use reader::{
    MessageReader, read_b_varbyte, read_b_varchar, read_bytes, read_ucs2, read_us_varbyte,
    read_us_varchar, skip,
};
pub use writer::PacketWriter;
