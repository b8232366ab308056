//! Type conversion error types.

use thiserror::Error;

/// Errors raised while reading, decoding or encoding typed values.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TypeError {
    /// The type id is not handled by the registry.
    #[error("unsupported TDS type 0x{0:02X}")]
    UnsupportedType(u8),

    /// The value does not fit the column type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected type name.
        expected: &'static str,
        /// Actual value kind.
        actual: &'static str,
    },

    /// A length prefix is not valid for the type.
    #[error("invalid length {length} for {type_name}")]
    InvalidLength {
        /// Type being read.
        type_name: &'static str,
        /// Length found on the wire.
        length: usize,
    },

    /// A numeric value does not fit the column width.
    #[error("value out of range for {target}")]
    OutOfRange {
        /// Target type name.
        target: &'static str,
    },

    /// The value is longer than the declared maximum.
    #[error("value of {length} bytes exceeds column maximum {max}")]
    Truncation {
        /// Encoded length.
        length: usize,
        /// Declared maximum.
        max: usize,
    },

    /// Invalid encoding in string data.
    #[error("invalid string encoding: {0}")]
    InvalidEncoding(String),

    /// Underlying read failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
