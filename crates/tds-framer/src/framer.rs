//! Split-I/O packet framer.
//!
//! The transport is split into read and write halves so an ATTENTION packet
//! can be sent while another task is blocked reading a large response.

use std::sync::Arc;

use bytes::Bytes;
use tds_protocol::packet::{MAX_NEGOTIATED_PACKET_SIZE, MIN_PACKET_SIZE, PacketType};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::FramerError;
use crate::reader::MessageReader;
use crate::writer::PacketWriter;

/// Packet framer over a byte transport.
///
/// # Example
///
/// ```rust,ignore
/// use tds_framer::PacketFramer;
/// use tds_protocol::PacketType;
///
/// let mut framer = PacketFramer::new(stream, 4096)?;
/// framer.send_message(PacketType::SqlBatch, &payload).await?;
/// let reply_type = framer.begin_read().await?;
/// let reader = framer.reader();
/// ```
pub struct PacketFramer<T> {
    reader: MessageReader<ReadHalf<T>>,
    writer: Arc<Mutex<PacketWriter<WriteHalf<T>>>>,
    packet_size: usize,
}

/// Check a packet size against the protocol range.
pub fn validate_packet_size(size: usize) -> Result<usize, FramerError> {
    if !(MIN_PACKET_SIZE..=MAX_NEGOTIATED_PACKET_SIZE).contains(&size) {
        return Err(FramerError::PacketSizeOutOfRange {
            size,
            min: MIN_PACKET_SIZE,
            max: MAX_NEGOTIATED_PACKET_SIZE,
        });
    }
    Ok(size)
}

impl<T> PacketFramer<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Split `transport` and frame it with `packet_size` byte packets.
    pub fn new(transport: T, packet_size: usize) -> Result<Self, FramerError> {
        let packet_size = validate_packet_size(packet_size)?;
        let (read_half, write_half) = tokio::io::split(transport);
        Ok(Self {
            reader: MessageReader::new(read_half, packet_size),
            writer: Arc::new(Mutex::new(PacketWriter::new(write_half, packet_size))),
            packet_size,
        })
    }

    /// Current packet size.
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Start a message.
    pub async fn begin_packet(&self, packet_type: PacketType, reset_connection: bool) {
        self.writer
            .lock()
            .await
            .begin_packet(packet_type, reset_connection);
    }

    /// Append bytes to the message in progress.
    pub async fn write(&self, data: &[u8]) -> Result<(), FramerError> {
        self.writer.lock().await.write(data).await
    }

    /// Send the last packet of the message in progress.
    pub async fn finish_packet(&self) -> Result<(), FramerError> {
        self.writer.lock().await.finish_packet().await
    }

    /// Send a whole message.
    pub async fn send_message(
        &self,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<(), FramerError> {
        let mut writer = self.writer.lock().await;
        writer.begin_packet(packet_type, false);
        writer.write(payload).await?;
        writer.finish_packet().await
    }

    /// Renegotiate the packet size in both directions.
    ///
    /// Bytes already buffered for an unfinished message are kept and go out
    /// in packets of the new size.
    pub async fn resize(&mut self, packet_size: usize) -> Result<(), FramerError> {
        let packet_size = validate_packet_size(packet_size)?;
        if packet_size == self.packet_size {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        tracing::debug!(
            old = self.packet_size,
            new = packet_size,
            buffered = writer.buffered(),
            "resizing packet buffers"
        );
        writer.resize(packet_size);
        self.reader.set_packet_size(packet_size);
        self.packet_size = packet_size;
        Ok(())
    }

    /// Read the first packet of the next message and return its type.
    pub async fn begin_read(&mut self) -> Result<PacketType, FramerError> {
        self.reader.begin_read().await
    }

    /// Byte stream of the message being read.
    pub fn reader(&mut self) -> &mut MessageReader<ReadHalf<T>> {
        &mut self.reader
    }

    /// Read one complete message.
    pub async fn read_message(&mut self) -> Result<(PacketType, Bytes), FramerError> {
        self.reader.read_message().await
    }

    /// Handle that can send ATTENTION from another task.
    pub fn attention_handle(&self) -> AttentionHandle<T> {
        AttentionHandle {
            writer: Arc::clone(&self.writer),
        }
    }

    /// Reassemble the transport.
    ///
    /// Fails while an [`AttentionHandle`] is alive or when the peer already
    /// sent bytes that have not been read.
    pub fn into_inner(self) -> Result<T, FramerError> {
        let buffered = self.reader.buffered_len();
        if buffered > 0 {
            return Err(FramerError::UnreadData(buffered));
        }
        let writer = Arc::try_unwrap(self.writer)
            .map_err(|_| FramerError::TransportShared)?
            .into_inner();
        let read_half = self.reader.into_inner();
        Ok(read_half.unsplit(writer.into_inner()))
    }
}

impl<T> std::fmt::Debug for PacketFramer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketFramer")
            .field("packet_size", &self.packet_size)
            .field("reader", &self.reader)
            .finish_non_exhaustive()
    }
}

/// Sends ATTENTION on a framer's write half.
///
/// The server acknowledges with a DONE token carrying the ATTN bit, read
/// through the framer as part of the outstanding response.
pub struct AttentionHandle<T> {
    writer: Arc<Mutex<PacketWriter<WriteHalf<T>>>>,
}

impl<T> AttentionHandle<T>
where
    T: AsyncWrite + Unpin,
{
    /// Send the ATTENTION packet.
    pub async fn send(&self) -> Result<(), FramerError> {
        tracing::debug!("sending attention");
        self.writer.lock().await.send_attention().await
    }
}

impl<T> Clone for AttentionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<T> std::fmt::Debug for AttentionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttentionHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_packet_size_range() {
        assert!(validate_packet_size(511).is_err());
        assert!(validate_packet_size(512).is_ok());
        assert!(validate_packet_size(32767).is_ok());
        assert!(validate_packet_size(32768).is_err());
    }

    #[tokio::test]
    async fn test_loopback_message() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let client = PacketFramer::new(client, 512).unwrap();
        let mut server = PacketFramer::new(server, 512).unwrap();

        let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        client
            .send_message(PacketType::SqlBatch, &payload)
            .await
            .unwrap();

        let (packet_type, received) = server.read_message().await.unwrap();
        assert_eq!(packet_type, PacketType::SqlBatch);
        assert_eq!(&received[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_resize_keeps_buffered_bytes() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut client = PacketFramer::new(client, 4096).unwrap();
        let mut server = PacketFramer::new(server, 4096).unwrap();

        client.begin_packet(PacketType::SqlBatch, false).await;
        client.write(&[1u8; 1000]).await.unwrap();
        client.resize(512).await.unwrap();
        client.write(&[2u8; 100]).await.unwrap();
        client.finish_packet().await.unwrap();

        server.begin_read().await.unwrap();
        let mut received = Vec::new();
        server.reader().read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 1100);
        assert!(received[..1000].iter().all(|&b| b == 1));
        assert!(received[1000..].iter().all(|&b| b == 2));
    }

    #[tokio::test]
    async fn test_into_inner_requires_exclusive_writer() {
        let (client, _server) = tokio::io::duplex(1024);
        let framer = PacketFramer::new(client, 4096).unwrap();
        let handle = framer.attention_handle();
        assert!(matches!(
            framer.into_inner(),
            Err(FramerError::TransportShared)
        ));
        drop(handle);
    }

    #[tokio::test]
    async fn test_attention_from_handle() {
        let (client, server) = tokio::io::duplex(1024);
        let client = PacketFramer::new(client, 4096).unwrap();
        let mut server = PacketFramer::new(server, 4096).unwrap();

        let handle = client.attention_handle();
        tokio::spawn(async move { handle.send().await.unwrap() })
            .await
            .unwrap();

        let (packet_type, payload) = server.read_message().await.unwrap();
        assert_eq!(packet_type, PacketType::Attention);
        assert!(payload.is_empty());
    }
}
