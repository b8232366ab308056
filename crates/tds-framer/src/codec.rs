//! Packet-level codec for tokio-util framing.

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::packet::{
    DEFAULT_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, check_declared_length,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FramerError;

/// A single physical packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header. `length` and `packet_id` are filled in by the encoder.
    pub header: PacketHeader,
    /// Payload, header excluded.
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet.
    #[must_use]
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Whether this is the last packet of its message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }
}

/// TDS packet codec.
///
/// Decoding enforces the malformed-packet rules: a declared length below the
/// header size, or above the current packet size, is fatal. Encoding numbers
/// packets from 1 within a message.
#[derive(Debug)]
pub struct TdsCodec {
    max_packet_size: usize,
    packet_id: u8,
}

impl TdsCodec {
    /// Codec for the default packet size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_packet_size(DEFAULT_PACKET_SIZE)
    }

    /// Codec for the given packet size.
    #[must_use]
    pub fn with_packet_size(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            packet_id: 1,
        }
    }

    /// Current packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Change the packet size.
    pub fn set_packet_size(&mut self, size: usize) {
        self.max_packet_size = size;
    }

    fn next_packet_id(&mut self) -> u8 {
        let id = self.packet_id;
        self.packet_id = self.packet_id.wrapping_add(1);
        if self.packet_id == 0 {
            self.packet_id = 1;
        }
        id
    }

    /// Restart packet numbering for a new message.
    pub fn reset_packet_id(&mut self) {
        self.packet_id = 1;
    }
}

impl Default for TdsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TdsCodec {
    type Item = Packet;
    type Error = FramerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[2], src[3]]);
        check_declared_length(length, self.max_packet_size)?;
        let length = length as usize;

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut packet = src.split_to(length).freeze();
        let header = PacketHeader::decode(&mut packet.clone())?;
        let payload = packet.split_off(PACKET_HEADER_SIZE);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length,
            packet_id = header.packet_id,
            is_eom = header.is_end_of_message(),
            "decoded TDS packet"
        );

        Ok(Some(Packet::new(header, payload)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(FramerError::TruncatedMessage),
        }
    }
}

impl Encoder<Packet> for TdsCodec {
    type Error = FramerError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total_length = PACKET_HEADER_SIZE + item.payload.len();
        let length = u16::try_from(total_length)
            .ok()
            .filter(|_| total_length <= self.max_packet_size)
            .ok_or(tds_protocol::ProtocolError::PacketLengthTooLarge {
                length: total_length,
                max: self.max_packet_size,
            })?;

        dst.reserve(total_length);

        let mut header = item.header;
        header.length = length;
        header.packet_id = self.next_packet_id();
        header.encode(dst);
        dst.put_slice(&item.payload);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = total_length,
            packet_id = header.packet_id,
            is_eom = header.is_end_of_message(),
            "encoded TDS packet"
        );

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::ProtocolError;
    use tds_protocol::packet::{PacketStatus, PacketType};

    fn raw_packet(length: u16, payload: &[u8]) -> BytesMut {
        let mut data = BytesMut::new();
        data.put_u8(PacketType::TabularResult as u8);
        data.put_u8(PacketStatus::END_OF_MESSAGE.bits());
        data.put_u16(length);
        data.put_u16(52);
        data.put_u8(1);
        data.put_u8(0);
        data.put_slice(payload);
        data
    }

    #[test]
    fn test_decode_packet() {
        let mut codec = TdsCodec::new();
        let mut data = raw_packet(12, b"test");

        let packet = codec.decode(&mut data).unwrap().unwrap();
        assert_eq!(packet.header.packet_type, PacketType::TabularResult);
        assert_eq!(packet.header.spid, 52);
        assert!(packet.is_end_of_message());
        assert_eq!(&packet.payload[..], b"test");
        assert!(data.is_empty());
    }

    #[test]
    fn test_incomplete_packet_waits() {
        let mut codec = TdsCodec::new();
        let mut data = raw_packet(12, b"te");
        assert!(codec.decode(&mut data).unwrap().is_none());
    }

    #[test]
    fn test_length_smaller_than_header_is_fatal() {
        let mut codec = TdsCodec::new();
        let mut data = raw_packet(4, b"");
        assert!(matches!(
            codec.decode(&mut data),
            Err(FramerError::Malformed(ProtocolError::PacketLengthTooSmall(4)))
        ));
    }

    #[test]
    fn test_length_larger_than_buffer_is_fatal() {
        let mut codec = TdsCodec::with_packet_size(512);
        let mut data = raw_packet(600, b"");
        assert!(matches!(
            codec.decode(&mut data),
            Err(FramerError::Malformed(ProtocolError::PacketLengthTooLarge {
                length: 600,
                max: 512
            }))
        ));
    }

    #[test]
    fn test_truncated_at_eof() {
        let mut codec = TdsCodec::new();
        let mut data = raw_packet(12, b"te");
        assert!(matches!(
            codec.decode_eof(&mut data),
            Err(FramerError::TruncatedMessage)
        ));
    }

    #[test]
    fn test_encode_numbers_packets() {
        let mut codec = TdsCodec::new();
        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::NORMAL, 0);
        let mut dst = BytesMut::new();

        codec
            .encode(Packet::new(header, Bytes::from_static(b"ab")), &mut dst)
            .unwrap();
        codec
            .encode(Packet::new(header, Bytes::from_static(b"cd")), &mut dst)
            .unwrap();

        assert_eq!(dst.len(), 20);
        assert_eq!(&dst[2..4], &[0, 10]);
        assert_eq!(dst[6], 1);
        assert_eq!(dst[16], 2);

        codec.reset_packet_id();
        let mut dst = BytesMut::new();
        codec
            .encode(Packet::new(header, Bytes::new()), &mut dst)
            .unwrap();
        assert_eq!(dst[6], 1);
    }

    #[test]
    fn test_encode_rejects_oversized_packet() {
        let mut codec = TdsCodec::with_packet_size(512);
        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 0);
        let payload = Bytes::from(vec![0u8; 512]);
        let mut dst = BytesMut::new();
        assert!(codec.encode(Packet::new(header, payload), &mut dst).is_err());
    }
}
