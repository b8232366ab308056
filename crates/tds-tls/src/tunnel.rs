//! TLS records carried inside PreLogin packets.
//!
//! TDS has no dedicated TLS port: the handshake records travel as the payload
//! of PreLogin packets. [`PreLoginTunnel`] sits between rustls and the socket
//! while the handshake runs, stripping packet headers on the way in and
//! packing outgoing records into PreLogin packets on flush. After
//! [`PreLoginTunnel::handshake_complete`] it passes bytes through untouched.
//!
//! The tunnel is symmetric, so a test server can run a `TlsAcceptor` over it
//! just as the client runs a `TlsConnector`.

use std::cmp;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use tds_protocol::packet::{
    MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
    check_declared_length, clamp_packet_size,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::TlsError;

/// Stream adapter framing TLS handshake records as PreLogin packets.
pub struct PreLoginTunnel<S> {
    stream: S,
    handshaking: bool,
    packet_size: usize,

    header: [u8; PACKET_HEADER_SIZE],
    header_pos: usize,
    read_remaining: usize,

    staged: BytesMut,
    outgoing: BytesMut,
}

impl<S> PreLoginTunnel<S> {
    /// Wrap `stream`, framing outgoing records in packets of `packet_size`.
    pub fn new(stream: S, packet_size: usize) -> Self {
        let packet_size = clamp_packet_size(packet_size);
        Self {
            stream,
            handshaking: true,
            packet_size,
            header: [0u8; PACKET_HEADER_SIZE],
            header_pos: 0,
            read_remaining: 0,
            staged: BytesMut::new(),
            outgoing: BytesMut::new(),
        }
    }

    /// Stop framing; later bytes go to the stream as they are.
    pub fn handshake_complete(&mut self) {
        tracing::trace!("PreLogin tunnel switched to pass-through");
        self.handshaking = false;
    }

    /// Whether records are still being framed.
    pub fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    /// Underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Unwrap the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn frame_staged(&mut self) {
        let capacity = self.packet_size - PACKET_HEADER_SIZE;
        let mut packet_id: u8 = 1;
        while !self.staged.is_empty() {
            let chunk = self.staged.split_to(cmp::min(capacity, self.staged.len()));
            let status = if self.staged.is_empty() {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            let length = (PACKET_HEADER_SIZE + chunk.len()) as u16;
            PacketHeader::new(PacketType::PreLogin, status, length)
                .with_packet_id(packet_id)
                .encode(&mut self.outgoing);
            self.outgoing.extend_from_slice(&chunk);
            tracing::trace!(length, packet_id, "framed TLS record bytes");
            packet_id = packet_id.wrapping_add(1);
        }
    }
}

impl<S: AsyncWrite + Unpin> PreLoginTunnel<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.outgoing.is_empty() {
            let written = ready!(Pin::new(&mut self.stream).poll_write(cx, &self.outgoing))?;
            if written == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.outgoing.advance(written);
        }
        Poll::Ready(Ok(()))
    }
}

fn invalid_data(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

impl<S: AsyncRead + Unpin> AsyncRead for PreLoginTunnel<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.handshaking {
            return Pin::new(&mut this.stream).poll_read(cx, buf);
        }

        while this.read_remaining == 0 {
            while this.header_pos < PACKET_HEADER_SIZE {
                let mut header_buf = ReadBuf::new(&mut this.header[this.header_pos..]);
                ready!(Pin::new(&mut this.stream).poll_read(cx, &mut header_buf))?;
                let n = header_buf.filled().len();
                if n == 0 {
                    if this.header_pos == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                this.header_pos += n;
            }
            this.header_pos = 0;

            let header = PacketHeader::decode(&mut &this.header[..]).map_err(invalid_data)?;
            if header.packet_type != PacketType::PreLogin {
                return Poll::Ready(Err(invalid_data(TlsError::UnexpectedPacket(
                    header.packet_type as u8,
                ))));
            }
            check_declared_length(header.length, MAX_PACKET_SIZE).map_err(invalid_data)?;
            this.read_remaining = header.payload_length();
            tracing::trace!(length = header.length, "reading tunnelled TLS record bytes");
        }

        let max_read = cmp::min(this.read_remaining, buf.remaining());
        if max_read == 0 {
            return Poll::Ready(Ok(()));
        }
        let n = {
            let mut limited = ReadBuf::new(buf.initialize_unfilled_to(max_read));
            ready!(Pin::new(&mut this.stream).poll_read(cx, &mut limited))?;
            limited.filled().len()
        };
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
        }
        buf.advance(n);
        this.read_remaining -= n;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PreLoginTunnel<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.handshaking {
            this.staged.extend_from_slice(buf);
            return Poll::Ready(Ok(buf.len()));
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.staged.is_empty() {
            this.frame_staged();
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.staged.is_empty() {
            this.frame_staged();
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

impl<S> std::fmt::Debug for PreLoginTunnel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreLoginTunnel")
            .field("handshaking", &self.handshaking)
            .field("packet_size", &self.packet_size)
            .field("staged", &self.staged.len())
            .field("outgoing", &self.outgoing.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn packet(packet_type: PacketType, status: PacketStatus, id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = PacketHeader::new(packet_type, status, (payload.len() + 8) as u16)
            .with_packet_id(id)
            .encode_to_bytes()
            .to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_flush_chunks_by_packet_size() {
        let record = vec![0x16; 600];
        let first = packet(PacketType::PreLogin, PacketStatus::NORMAL, 1, &record[..504]);
        let second = packet(
            PacketType::PreLogin,
            PacketStatus::END_OF_MESSAGE,
            2,
            &record[504..],
        );
        let mut expected = first;
        expected.extend(second);
        let mock = tokio_test::io::Builder::new().write(&expected).build();

        let mut tunnel = PreLoginTunnel::new(mock, 512);
        tunnel.write_all(&record).await.unwrap();
        tunnel.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_strips_headers() {
        let mock = tokio_test::io::Builder::new()
            .read(&packet(PacketType::PreLogin, PacketStatus::NORMAL, 1, b"hel"))
            .read(&packet(PacketType::PreLogin, PacketStatus::END_OF_MESSAGE, 2, b"lo"))
            .build();

        let mut tunnel = PreLoginTunnel::new(mock, 4096);
        let mut out = Vec::new();
        tunnel.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_non_prelogin_packet_rejected() {
        // Only the header is scripted: the tunnel rejects the packet before
        // touching its payload.
        let wire = packet(PacketType::TabularResult, PacketStatus::END_OF_MESSAGE, 1, b"x");
        let mock = tokio_test::io::Builder::new()
            .read(&wire[..PACKET_HEADER_SIZE])
            .build();

        let mut tunnel = PreLoginTunnel::new(mock, 4096);
        let mut out = [0u8; 16];
        let err = tunnel.read(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_pass_through_after_handshake() {
        let mock = tokio_test::io::Builder::new()
            .write(b"raw")
            .read(b"reply")
            .build();

        let mut tunnel = PreLoginTunnel::new(mock, 4096);
        tunnel.handshake_complete();
        tunnel.write_all(b"raw").await.unwrap();
        let mut out = [0u8; 5];
        tunnel.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"reply");
    }

    #[tokio::test]
    async fn test_truncated_header_is_eof_error() {
        let mock = tokio_test::io::Builder::new().read(&[0x12, 0x01, 0x00]).build();
        let mut tunnel = PreLoginTunnel::new(mock, 4096);
        let mut out = [0u8; 4];
        let err = tunnel.read(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
