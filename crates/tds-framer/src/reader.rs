//! Message-scoped packet reader.
//!
//! [`MessageReader`] presents one logical message as a byte stream: reads
//! cross packet boundaries transparently and return 0 once the packet
//! carrying END_OF_MESSAGE is exhausted. Use [`MessageReader::begin_read`]
//! to move on to the next message.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use pin_project_lite::pin_project;
use tds_protocol::packet::PacketType;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::codec::FramedRead;

use crate::codec::TdsCodec;
use crate::error::FramerError;

pin_project! {
    /// Reads logical messages out of a stream of packets.
    pub struct MessageReader<T> {
        #[pin]
        packets: FramedRead<T, TdsCodec>,
        current: Bytes,
        end_of_message: bool,
        packet_type: Option<PacketType>,
        spid: u16,
    }
}

impl<T> MessageReader<T>
where
    T: AsyncRead,
{
    /// Reader over `transport` accepting packets up to `packet_size` bytes.
    pub fn new(transport: T, packet_size: usize) -> Self {
        Self {
            packets: FramedRead::new(transport, TdsCodec::with_packet_size(packet_size)),
            current: Bytes::new(),
            end_of_message: true,
            packet_type: None,
            spid: 0,
        }
    }

    /// Type of the message being read.
    pub fn packet_type(&self) -> Option<PacketType> {
        self.packet_type
    }

    /// Server process id from the last packet header.
    pub fn spid(&self) -> u16 {
        self.spid
    }

    /// Largest packet accepted.
    pub fn packet_size(&self) -> usize {
        self.packets.decoder().packet_size()
    }

    /// Accept packets up to `size` bytes from the next read on.
    pub fn set_packet_size(&mut self, size: usize) {
        self.packets.decoder_mut().set_packet_size(size);
    }

    /// Bytes received from the transport but not yet framed.
    pub fn buffered_len(&self) -> usize {
        self.packets.read_buffer().len()
    }

    /// Unwrap the transport.
    pub fn into_inner(self) -> T {
        self.packets.into_inner()
    }

    fn poll_fill(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<bool, FramerError>> {
        let mut this = self.project();
        loop {
            if !this.current.is_empty() {
                return Poll::Ready(Ok(true));
            }
            if *this.end_of_message {
                return Poll::Ready(Ok(false));
            }
            match ready!(this.packets.as_mut().poll_next(cx)) {
                Some(Ok(packet)) => {
                    *this.spid = packet.header.spid;
                    *this.end_of_message = packet.is_end_of_message();
                    *this.current = packet.payload;
                }
                Some(Err(err)) => return Poll::Ready(Err(err)),
                None => return Poll::Ready(Err(FramerError::TruncatedMessage)),
            }
        }
    }
}

impl<T> MessageReader<T>
where
    T: AsyncRead + Unpin,
{
    /// Read the first packet of the next message and return its type.
    ///
    /// Any unread remainder of the previous message is discarded, so callers
    /// must drain a response before starting the next one.
    pub async fn begin_read(&mut self) -> Result<PacketType, FramerError> {
        use futures_util::StreamExt;

        if !self.current.is_empty() || !self.end_of_message {
            tracing::debug!(
                unread = self.current.len(),
                "discarding the rest of the previous message"
            );
        }

        let packet = match self.packets.next().await {
            Some(packet) => packet?,
            None => return Err(FramerError::ConnectionClosed),
        };
        let packet_type = packet.header.packet_type;
        self.spid = packet.header.spid;
        self.end_of_message = packet.is_end_of_message();
        self.current = packet.payload;
        self.packet_type = Some(packet_type);
        Ok(packet_type)
    }

    /// Whether the current message has been read to its end.
    ///
    /// May fetch continuation packets, since a packet can carry an empty
    /// payload.
    pub async fn is_end_of_message(&mut self) -> Result<bool, FramerError> {
        let has_data = std::future::poll_fn(|cx| Pin::new(&mut *self).poll_fill(cx)).await?;
        Ok(!has_data)
    }

    /// Read the rest of the current message.
    pub async fn read_to_end_of_message(&mut self) -> Result<Bytes, FramerError> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf).await.map_err(FramerError::from_io)?;
        Ok(Bytes::from(buf))
    }

    /// Read one complete message.
    pub async fn read_message(&mut self) -> Result<(PacketType, Bytes), FramerError> {
        let packet_type = self.begin_read().await?;
        let payload = self.read_to_end_of_message().await?;
        Ok((packet_type, payload))
    }
}

impl<T> AsyncRead for MessageReader<T>
where
    T: AsyncRead,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        match ready!(self.as_mut().poll_fill(cx)) {
            Ok(true) => {
                let this = self.project();
                let n = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current.split_to(n));
                Poll::Ready(Ok(()))
            }
            Ok(false) => Poll::Ready(Ok(())),
            Err(err) => Poll::Ready(Err(err.into_io())),
        }
    }
}

impl<T> std::fmt::Debug for MessageReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReader")
            .field("packet_type", &self.packet_type)
            .field("unread", &self.current.len())
            .field("end_of_message", &self.end_of_message)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Field readers
// =============================================================================

fn invalid_data(err: tds_protocol::ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, FramerError::Malformed(err))
}

/// Read exactly `len` bytes.
pub async fn read_bytes<R>(reader: &mut R, len: usize) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(buf.freeze())
}

/// Skip `len` bytes.
pub async fn skip<R>(reader: &mut R, len: usize) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut limited = (&mut *reader).take(len as u64);
    let copied = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
    if copied < len as u64 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

/// Read `chars` UTF-16 code units.
pub async fn read_ucs2<R>(reader: &mut R, chars: usize) -> io::Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let raw = read_bytes(reader, chars * 2).await?;
    tds_protocol::codec::decode_ucs2(&raw).map_err(invalid_data)
}

/// Read a B_VARCHAR: one-byte character count, then UTF-16LE.
pub async fn read_b_varchar<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let chars = reader.read_u8().await? as usize;
    read_ucs2(reader, chars).await
}

/// Read a US_VARCHAR: two-byte character count, then UTF-16LE.
pub async fn read_us_varchar<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let chars = reader.read_u16_le().await? as usize;
    read_ucs2(reader, chars).await
}

/// Read a B_VARBYTE: one-byte length, then bytes.
pub async fn read_b_varbyte<R>(reader: &mut R) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u8().await? as usize;
    read_bytes(reader, len).await
}

/// Read a US_VARBYTE: two-byte length, then bytes.
pub async fn read_us_varbyte<R>(reader: &mut R) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u16_le().await? as usize;
    read_bytes(reader, len).await
}
