//! Authenticated session.
//!
//! A [`Session`] owns the framer, the session state and the token decoder of
//! one connection. Its primitive is "send a request, then pull the events of
//! its response"; everything above that (SQL text, RPC parameters, result
//! set ergonomics) belongs to the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_core::Stream;
use tds_framer::{AttentionHandle, PacketFramer};
use tds_protocol::packet::PacketType;
use tds_protocol::sql_batch::SqlBatch;
use tds_types::TypeRegistry;
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::decoder::{MessageObserver, TokenDecoder};
use crate::error::{Error, Result};
use crate::event::ProtocolEvent;
use crate::handshake::Handshake;
use crate::state::{ResponseState, SessionState};
use crate::transport::Transport;

/// An authenticated connection.
///
/// Strictly half-duplex: a response must be read to its end before the next
/// request is sent. Only [`CancelHandle`] may be used from another task.
pub struct Session {
    framer: PacketFramer<Transport>,
    state: SessionState,
    decoder: TokenDecoder,
    response: ResponseState,
    attention: Arc<AtomicBool>,
    encrypted: bool,
    host: String,
    port: u16,
}

impl Session {
    /// Connect and log in.
    pub async fn connect(config: Config) -> Result<Self> {
        Handshake::new(config).connect().await
    }

    /// Connect and log in, decoding column data with `registry`.
    pub async fn connect_with_registry(
        config: Config,
        registry: Arc<dyn TypeRegistry>,
    ) -> Result<Self> {
        Handshake::new(config).with_registry(registry).connect().await
    }

    pub(crate) fn from_parts(
        framer: PacketFramer<Transport>,
        state: SessionState,
        decoder: TokenDecoder,
        encrypted: bool,
        host: String,
        port: u16,
    ) -> Self {
        Self {
            framer,
            state,
            decoder,
            response: ResponseState::Idle,
            attention: Arc::new(AtomicBool::new(false)),
            encrypted,
            host,
            port,
        }
    }

    /// Send a request message built by the caller.
    ///
    /// Fails if the previous response was not read to its end or a decode
    /// failure left the session unusable.
    pub async fn send_request(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        match self.response {
            ResponseState::Poisoned => {
                return Err(Error::ProtocolViolation(
                    "session is unusable after a failed response".into(),
                ));
            }
            ResponseState::Reading => {
                return Err(Error::ProtocolViolation(
                    "previous response has not been read to its end".into(),
                ));
            }
            ResponseState::Idle => {}
        }

        tracing::trace!(packet_type = ?packet_type, length = payload.len(), "sending request");
        if let Err(err) = self.framer.send_message(packet_type, payload).await {
            self.response = ResponseState::Poisoned;
            return Err(err.into());
        }
        self.response = ResponseState::Reading;
        self.decoder.start_response();
        Ok(())
    }

    /// Send a SQL batch, tagged with the active transaction.
    pub async fn send_sql_batch(&mut self, sql: &str) -> Result<()> {
        tracing::debug!(sql = %sql, transaction = self.state.transaction_id, "sending SQL batch");
        let batch = SqlBatch::new(sql).in_transaction(self.state.transaction_id);
        self.send_request(PacketType::SqlBatch, &batch.encode()).await
    }

    /// Next event of the outstanding response.
    ///
    /// Returns `Ok(None)` once the response is complete. A server error is
    /// returned as `Err(Error::Server)` and reading may continue; any other
    /// error ends the session and later calls return `Ok(None)`.
    ///
    /// After a cancel, events keep flowing until the server's
    /// acknowledgement (a DONE with the attention bit) has been returned.
    pub async fn next_event(&mut self) -> Result<Option<ProtocolEvent>> {
        if self.response != ResponseState::Reading {
            return Ok(None);
        }
        loop {
            match self.decoder.next_event(&mut self.framer, &mut self.state).await {
                Ok(Some(event)) => {
                    if event.as_done().is_some_and(|d| d.is_attention_ack()) {
                        tracing::debug!("attention acknowledged");
                        self.attention.store(false, Ordering::Release);
                    }
                    return Ok(Some(event));
                }
                // The acknowledgement comes in a message of its own.
                Ok(None) if self.attention.load(Ordering::Acquire) => {
                    self.decoder.start_response();
                }
                Ok(None) => {
                    self.response = ResponseState::Idle;
                    return Ok(None);
                }
                Err(err @ Error::Server { .. }) => {
                    if self.decoder.is_finished() && !self.attention.load(Ordering::Acquire) {
                        self.response = ResponseState::Idle;
                    }
                    return Err(err);
                }
                Err(err) => {
                    self.response = ResponseState::Poisoned;
                    return Err(err);
                }
            }
        }
    }

    /// The outstanding response as a stream.
    ///
    /// A fatal error is the stream's last item.
    pub fn events(&mut self) -> impl Stream<Item = Result<ProtocolEvent>> + '_ {
        futures_util::stream::unfold(self, |session| async move {
            match session.next_event().await {
                Ok(Some(event)) => Some((Ok(event), session)),
                Ok(None) => None,
                Err(err) => Some((Err(err), session)),
            }
        })
    }

    /// Read and drop the rest of the outstanding response.
    ///
    /// Returns the first server error seen, after the response has ended.
    pub async fn drain(&mut self) -> Result<()> {
        let mut first_error = None;
        loop {
            match self.next_event().await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err @ Error::Server { .. }) => {
                    first_error.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Ask the server to stop the outstanding request.
    ///
    /// Keep reading events afterwards; the acknowledgement arrives as a
    /// [`ProtocolEvent::Done`] with the attention bit set.
    pub async fn cancel(&mut self) -> Result<()> {
        if self.response != ResponseState::Reading {
            return Err(Error::ProtocolViolation("no request is outstanding".into()));
        }
        self.cancel_handle().cancel().await
    }

    /// Handle for cancelling from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            attention: self.framer.attention_handle(),
            pending: Arc::clone(&self.attention),
        }
    }

    /// Session state as last updated by the server.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Current packet size.
    pub fn packet_size(&self) -> usize {
        self.framer.packet_size()
    }

    /// Request/response position.
    pub fn response_state(&self) -> ResponseState {
        self.response
    }

    /// Whether the transport stays encrypted.
    ///
    /// False after login-only encryption, which reverts to plain once
    /// LOGIN7 is out.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Host this session is connected to, after any redirect.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port this session is connected to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Install or clear the INFO hook.
    pub fn set_message_observer(&mut self, observer: Option<MessageObserver>) {
        self.decoder.set_observer(observer);
    }

    /// The token decoder, for registering extra tokens.
    pub fn decoder_mut(&mut self) -> &mut TokenDecoder {
        &mut self.decoder
    }

    /// Close the connection.
    pub async fn close(self) -> Result<()> {
        tracing::debug!(host = %self.host, port = self.port, "closing session");
        match self.framer.into_inner() {
            Ok(mut transport) => transport.shutdown().await?,
            // A live cancel handle or unread bytes: dropping closes the socket.
            Err(err) => tracing::debug!(error = %err, "dropping transport without shutdown"),
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("encrypted", &self.encrypted)
            .field("response", &self.response)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Sends ATTENTION for a session's outstanding request.
///
/// Sending while no request is outstanding is a misuse: the server still
/// acknowledges, and the next response read would start with that
/// acknowledgement.
#[derive(Clone)]
pub struct CancelHandle {
    attention: AttentionHandle<Transport>,
    pending: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Send the ATTENTION packet.
    pub async fn cancel(&self) -> Result<()> {
        self.pending.store(true, Ordering::Release);
        self.attention.send().await?;
        Ok(())
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
