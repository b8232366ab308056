//! Protocol-level error type.

use thiserror::Error;

/// Errors raised while encoding or decoding TDS wire structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Not enough bytes were available for the structure being decoded.
    #[error("incomplete data: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Input ended in the middle of a field.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Unknown packet type byte in a packet header.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Unknown bits in a packet header status byte.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Header length smaller than the header itself.
    #[error("packet length {0} is smaller than the packet header")]
    PacketLengthTooSmall(u16),

    /// Header length larger than the receive buffer.
    #[error("packet length {length} exceeds the negotiated packet size {max}")]
    PacketLengthTooLarge {
        /// Declared length.
        length: usize,
        /// Allocated buffer size.
        max: usize,
    },

    /// A Pre-Login option header points outside the record.
    #[error("pre-login option 0x{option:02X} is out of bounds (offset {offset}, length {length})")]
    PreLoginOptionOutOfBounds {
        /// Option tag.
        option: u8,
        /// Declared offset.
        offset: u16,
        /// Declared length.
        length: u16,
    },

    /// A Pre-Login option carries a value of the wrong size.
    #[error("pre-login option 0x{option:02X} has invalid length {length}")]
    InvalidPreLoginOption {
        /// Option tag.
        option: u8,
        /// Declared length.
        length: u16,
    },

    /// Token id with no registered decoder.
    #[error("invalid token type: 0x{0:02X}")]
    InvalidTokenType(u8),

    /// Environment change discriminant with no known layout.
    #[error("unrecognized environment change type: {0}")]
    UnknownEnvChange(u8),

    /// A field holds a value outside its documented range.
    #[error("invalid value {value} for field {field}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: u32,
    },

    /// A variable-length field does not fit its length prefix.
    #[error("{field} is too long: {len} bytes (max {max})")]
    ValueTooLarge {
        /// Field name.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Maximum permitted length.
        max: usize,
    },

    /// The same feature extension was added twice.
    #[error("feature extension 0x{0:02X} is already present")]
    DuplicateFeature(u8),

    /// UTF-16 data that does not decode.
    #[error("string encoding error: {0}")]
    StringEncoding(String),
}
