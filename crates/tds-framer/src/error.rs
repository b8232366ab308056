//! Framing errors.

use std::io;

use tds_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by the packet framer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FramerError {
    /// Transport I/O failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// A packet header is inconsistent with the stream.
    #[error("malformed packet: {0}")]
    Malformed(#[from] ProtocolError),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The peer closed the connection in the middle of a message.
    #[error("connection closed in the middle of a message")]
    TruncatedMessage,

    /// Requested packet size is outside the protocol range.
    #[error("packet size {size} outside {min}..={max}")]
    PacketSizeOutOfRange {
        /// Requested size.
        size: usize,
        /// Smallest allowed size.
        min: usize,
        /// Largest allowed size.
        max: usize,
    },

    /// The transport cannot be reclaimed while an attention handle is alive.
    #[error("transport is still shared with an attention handle")]
    TransportShared,

    /// The transport cannot be reclaimed with unread bytes buffered.
    #[error("{0} unread bytes buffered")]
    UnreadData(usize),
}

impl FramerError {
    /// Wrap into an `io::Error` for the `AsyncRead` boundary.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Self::Io(err) => err,
            Self::ConnectionClosed | Self::TruncatedMessage => {
                io::Error::new(io::ErrorKind::UnexpectedEof, self)
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }

    /// Recover a framer error carried through an `io::Error`.
    ///
    /// Short reads inside a message surface as `UnexpectedEof` and come
    /// back as [`FramerError::TruncatedMessage`].
    #[must_use]
    pub fn from_io(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<Self>()) {
            return if err.kind() == io::ErrorKind::UnexpectedEof {
                Self::TruncatedMessage
            } else {
                Self::Io(err)
            };
        }
        match err.into_inner().map(|inner| inner.downcast::<Self>()) {
            Some(Ok(framer)) => *framer,
            _ => Self::TruncatedMessage,
        }
    }

    /// Whether the stream content, not the transport, is at fault.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::TruncatedMessage)
    }
}
