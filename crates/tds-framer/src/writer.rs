//! Buffered packet writer.
//!
//! Message bytes accumulate in a buffer. Whenever it holds more than one
//! packet's worth of payload, a full packet is sent without END_OF_MESSAGE.
//! [`PacketWriter::finish_packet`] sends the remainder flagged as the last
//! packet. The buffer survives a packet size change, so bytes written before
//! a resize go out in packets of the new size.

use bytes::{Bytes, BytesMut};
use futures_util::SinkExt;
use tds_protocol::packet::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;

use crate::codec::{Packet, TdsCodec};
use crate::error::FramerError;

/// Writes logical messages as a sequence of packets.
pub struct PacketWriter<T> {
    sink: FramedWrite<T, TdsCodec>,
    buf: BytesMut,
    packet_type: PacketType,
    reset_connection: bool,
    packets_sent: usize,
}

impl<T> PacketWriter<T>
where
    T: AsyncWrite + Unpin,
{
    /// Writer over `transport` producing packets of `packet_size` bytes.
    pub fn new(transport: T, packet_size: usize) -> Self {
        Self {
            sink: FramedWrite::new(transport, TdsCodec::with_packet_size(packet_size)),
            buf: BytesMut::with_capacity(packet_size),
            packet_type: PacketType::SqlBatch,
            reset_connection: false,
            packets_sent: 0,
        }
    }

    /// Packet size in use.
    pub fn packet_size(&self) -> usize {
        self.sink.encoder().packet_size()
    }

    fn payload_capacity(&self) -> usize {
        self.packet_size() - PACKET_HEADER_SIZE
    }

    /// Bytes buffered for the message in progress.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Start a message of the given type.
    ///
    /// `reset_connection` sets RESETCONNECTION on the first packet only.
    pub fn begin_packet(&mut self, packet_type: PacketType, reset_connection: bool) {
        if !self.buf.is_empty() {
            tracing::debug!(
                discarded = self.buf.len(),
                "starting a new message over an unfinished one"
            );
            self.buf.clear();
        }
        self.packet_type = packet_type;
        self.reset_connection = reset_connection;
        self.packets_sent = 0;
        self.sink.encoder_mut().reset_packet_id();
    }

    /// Append message bytes, sending full packets as the buffer fills.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), FramerError> {
        self.buf.extend_from_slice(data);
        self.drain_full_packets().await
    }

    /// Send the buffered remainder as the last packet and flush.
    pub async fn finish_packet(&mut self) -> Result<(), FramerError> {
        self.drain_full_packets().await?;
        let payload = self.buf.split().freeze();
        self.send(payload, true).await?;
        self.sink.flush().await?;
        tracing::trace!(
            packet_type = ?self.packet_type,
            packets = self.packets_sent,
            "message sent"
        );
        Ok(())
    }

    /// Change the packet size without touching buffered bytes.
    pub fn resize(&mut self, packet_size: usize) {
        self.sink.encoder_mut().set_packet_size(packet_size);
        if self.buf.capacity() < packet_size {
            self.buf.reserve(packet_size - self.buf.len());
        }
    }

    /// Send a zero-length ATTENTION packet and flush.
    pub async fn send_attention(&mut self) -> Result<(), FramerError> {
        let header = PacketHeader::new(PacketType::Attention, PacketStatus::END_OF_MESSAGE, 0);
        self.sink.send(Packet::new(header, Bytes::new())).await
    }

    /// Unwrap the transport.
    pub fn into_inner(self) -> T {
        self.sink.into_inner()
    }

    async fn drain_full_packets(&mut self) -> Result<(), FramerError> {
        let capacity = self.payload_capacity();
        // Strictly greater: a final full packet must still carry END_OF_MESSAGE.
        while self.buf.len() > capacity {
            let payload = self.buf.split_to(capacity).freeze();
            self.send(payload, false).await?;
        }
        Ok(())
    }

    async fn send(&mut self, payload: Bytes, last: bool) -> Result<(), FramerError> {
        let mut status = if last {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        if self.packets_sent == 0 && self.reset_connection {
            status |= PacketStatus::RESET_CONNECTION;
        }
        let header = PacketHeader::new(self.packet_type, status, 0);
        self.sink.send(Packet::new(header, payload)).await?;
        self.packets_sent += 1;
        Ok(())
    }
}

impl<T> std::fmt::Debug for PacketWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter")
            .field("packet_type", &self.packet_type)
            .field("packet_size", &self.sink.encoder().packet_size())
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn header(packet_type: PacketType, status: PacketStatus, len: u16, id: u8) -> Vec<u8> {
        PacketHeader::new(packet_type, status, len)
            .with_packet_id(id)
            .encode_to_bytes()
            .to_vec()
    }

    #[tokio::test]
    async fn test_single_packet_message() {
        let mut expected = header(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 11, 1);
        expected.extend(b"abc");
        let mock = tokio_test::io::Builder::new().write(&expected).build();

        let mut writer = PacketWriter::new(mock, 512);
        writer.begin_packet(PacketType::SqlBatch, false);
        writer.write(b"abc").await.unwrap();
        writer.finish_packet().await.unwrap();
    }

    #[tokio::test]
    async fn test_exactly_full_packet_keeps_eom() {
        let payload = vec![0x5A; 512 - 8];
        let mut expected = header(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 512, 1);
        expected.extend(&payload);
        let mock = tokio_test::io::Builder::new().write(&expected).build();

        let mut writer = PacketWriter::new(mock, 512);
        writer.begin_packet(PacketType::SqlBatch, false);
        writer.write(&payload).await.unwrap();
        writer.finish_packet().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_flag_on_first_packet_only() {
        let payload = vec![1u8; 600];
        let mut first = header(
            PacketType::SqlBatch,
            PacketStatus::NORMAL | PacketStatus::RESET_CONNECTION,
            512,
            1,
        );
        first.extend(&payload[..504]);
        let mut second = header(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 104, 2);
        second.extend(&payload[504..]);
        let mock = tokio_test::io::Builder::new()
            .write(&first)
            .write(&second)
            .build();

        let mut writer = PacketWriter::new(mock, 512);
        writer.begin_packet(PacketType::SqlBatch, true);
        writer.write(&payload).await.unwrap();
        writer.finish_packet().await.unwrap();
    }

    #[tokio::test]
    async fn test_attention_packet() {
        let expected = header(PacketType::Attention, PacketStatus::END_OF_MESSAGE, 8, 1);
        let mock = tokio_test::io::Builder::new().write(&expected).build();

        let mut writer = PacketWriter::new(mock, 4096);
        writer.send_attention().await.unwrap();
    }
}
