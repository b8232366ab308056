//! Physical packet header.
//!
//! Every TDS packet starts with the same 8 byte header. Unlike the rest of
//! the protocol, the header's `length` and `spid` fields are big-endian.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Largest packet the 16-bit length field can describe.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Smallest packet size a server will negotiate.
pub const MIN_PACKET_SIZE: usize = 512;

/// Largest packet size a client may request in LOGIN7.
pub const MAX_NEGOTIATED_PACKET_SIZE: usize = 32767;

/// Packet size used until the server says otherwise.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Bring a requested packet size into the negotiable range.
#[must_use]
pub fn clamp_packet_size(size: usize) -> usize {
    size.clamp(MIN_PACKET_SIZE, MAX_NEGOTIATED_PACKET_SIZE)
}

/// Validate a raw header length against the receive buffer size.
///
/// A length below the header size or above `max_packet_size` can never
/// belong to a well-formed packet. Readers that peek at the length before
/// decoding the rest of the header call this directly.
pub fn check_declared_length(length: u16, max_packet_size: usize) -> Result<(), ProtocolError> {
    let len = usize::from(length);
    if len < PACKET_HEADER_SIZE {
        Err(ProtocolError::PacketLengthTooSmall(length))
    } else if len > max_packet_size {
        Err(ProtocolError::PacketLengthTooLarge {
            length: len,
            max: max_packet_size,
        })
    } else {
        Ok(())
    }
}

/// Message type carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch request.
    SqlBatch = 0x01,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Server reply carrying a token stream.
    TabularResult = 0x04,
    /// Attention (cancel) signal.
    Attention = 0x06,
    /// Bulk load data.
    BulkLoad = 0x07,
    /// Federated authentication token.
    FedAuthToken = 0x08,
    /// Transaction manager request.
    TransactionManager = 0x0E,
    /// LOGIN7 record.
    Login7 = 0x10,
    /// SSPI continuation message.
    Sspi = 0x11,
    /// Pre-Login record, also used to tunnel the TLS handshake.
    PreLogin = 0x12,
}

impl PacketType {
    const ALL: [Self; 10] = [
        Self::SqlBatch,
        Self::Rpc,
        Self::TabularResult,
        Self::Attention,
        Self::BulkLoad,
        Self::FedAuthToken,
        Self::TransactionManager,
        Self::Login7,
        Self::Sspi,
        Self::PreLogin,
    ];

    /// Parse a packet type byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Self::ALL
            .into_iter()
            .find(|ty| *ty as u8 == value)
            .ok_or(ProtocolError::InvalidPacketType(value))
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value)
    }
}

bitflags! {
    /// Second header byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// More packets follow.
        const NORMAL = 0x00;
        /// Last packet of the message.
        const END_OF_MESSAGE = 0x01;
        /// Sender asks the receiver to discard the message.
        const IGNORE_EVENT = 0x02;
        /// Reset session state before running the request.
        const RESET_CONNECTION = 0x08;
        /// Like `RESET_CONNECTION`, keeping the open transaction.
        const RESET_CONNECTION_KEEP_TRANSACTION = 0x10;
    }
}

/// Decoded 8 byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of the message this packet belongs to.
    pub packet_type: PacketType,
    /// Status bits.
    pub status: PacketStatus,
    /// Total packet length, header included.
    pub length: u16,
    /// Server process id, only meaningful in replies.
    pub spid: u16,
    /// Sequence number within the connection, modulo 256.
    pub packet_id: u8,
    /// Reserved.
    pub window: u8,
}

impl PacketHeader {
    /// Header with zero spid, packet id and window.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id: 0,
            window: 0,
        }
    }

    /// Same header with another sequence number.
    #[must_use]
    pub const fn with_packet_id(self, packet_id: u8) -> Self {
        Self { packet_id, ..self }
    }

    /// Decode a header from the first 8 bytes of `src`.
    ///
    /// Status bytes with undefined bits are rejected. The declared length is
    /// not checked here; see [`PacketHeader::check_length`].
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let available = src.remaining();
        if available < PACKET_HEADER_SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: PACKET_HEADER_SIZE,
                actual: available,
            });
        }
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        src.copy_to_slice(&mut raw);

        let [ty, status, len_hi, len_lo, spid_hi, spid_lo, packet_id, window] = raw;
        Ok(Self {
            packet_type: PacketType::from_u8(ty)?,
            status: PacketStatus::from_bits(status)
                .ok_or(ProtocolError::InvalidPacketStatus(status))?,
            length: u16::from_be_bytes([len_hi, len_lo]),
            spid: u16::from_be_bytes([spid_hi, spid_lo]),
            packet_id,
            window,
        })
    }

    /// Wire form of the header.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_SIZE] {
        let [len_hi, len_lo] = self.length.to_be_bytes();
        let [spid_hi, spid_lo] = self.spid.to_be_bytes();
        [
            self.packet_type as u8,
            self.status.bits(),
            len_hi,
            len_lo,
            spid_hi,
            spid_lo,
            self.packet_id,
            self.window,
        ]
    }

    /// Append the header to `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(&self.to_bytes());
    }

    /// Header in a fresh buffer.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Check the declared length against a receive buffer of
    /// `max_packet_size` bytes.
    pub fn check_length(&self, max_packet_size: usize) -> Result<(), ProtocolError> {
        check_declared_length(self.length, max_packet_size)
    }

    /// Bytes following the header.
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.length.saturating_sub(PACKET_HEADER_SIZE as u16) as usize
    }

    /// Whether this is the last packet of its message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }
}
