//! Token stream decoder.
//!
//! [`TokenDecoder`] pulls one token at a time out of the framer's message
//! stream and turns it into a [`ProtocolEvent`]. It suspends only when the
//! current packet is exhausted and the message continues in the next one.
//!
//! ## Error tokens
//!
//! ERROR tokens are held until the DONE that closes the statement, then the
//! last one held is returned as [`Error::Server`]. A server error does not
//! end the response: if the DONE carried the MORE bit, the next call carries
//! on with the following statement.
//!
//! ## Failure
//!
//! Any other failure (transport, malformed packet, unexpected token,
//! unrecognized ENVCHANGE) poisons the decoder. The error is returned once
//! and every later call returns `Ok(None)`.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tds_framer::{FramerError, PacketFramer, read_b_varchar, read_bytes, skip};
use tds_protocol::packet::PacketType;
use tds_protocol::token::{
    Done, EnvChange, FeatureExtAck, FedAuthInfo, LoginAck, NO_METADATA, Order, ServerMessage,
};
use tds_protocol::feature_ext::FEATURE_TERMINATOR;
use tds_types::{TypeRegistry, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::dispatch::{DispatchTable, LengthPrefix, TokenKind};
use crate::error::{Error, Result};
use crate::event::{ColumnDescriptor, ColumnFlags, ProtocolEvent, ReturnValue};
use crate::state::{EnvEffect, SessionState};

/// Upper bound for tokens with a four-byte length prefix.
const MAX_LONG_TOKEN: usize = 16 * 1024 * 1024;

/// Hook receiving every INFO token.
pub type MessageObserver = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// The next call reads the first packet of a new message.
    AwaitingMessage,
    /// Inside a message.
    Reading,
    /// The final DONE was seen or the message ended.
    Finished,
    /// A fatal error was returned.
    Poisoned,
}

/// Pull-based decoder for one session's token stream.
pub struct TokenDecoder {
    registry: Arc<dyn TypeRegistry>,
    table: DispatchTable,
    columns: Arc<[ColumnDescriptor]>,
    pending_error: Option<ServerMessage>,
    observer: Option<MessageObserver>,
    phase: Phase,
}

fn read_error(err: io::Error) -> Error {
    FramerError::from_io(err).into()
}

impl TokenDecoder {
    /// Decoder using `registry` for column data and the standard table.
    pub fn new(registry: Arc<dyn TypeRegistry>) -> Self {
        Self {
            registry,
            table: DispatchTable::standard(),
            columns: Arc::from(Vec::new()),
            pending_error: None,
            observer: None,
            phase: Phase::Finished,
        }
    }

    /// Replace the dispatch table.
    #[must_use]
    pub fn with_table(mut self, table: DispatchTable) -> Self {
        self.table = table;
        self
    }

    /// Dispatch table, for registering extra tokens.
    pub fn table_mut(&mut self) -> &mut DispatchTable {
        &mut self.table
    }

    /// Install or clear the INFO hook.
    pub fn set_observer(&mut self, observer: Option<MessageObserver>) {
        self.observer = observer;
    }

    /// Metadata of the current result set.
    pub fn columns(&self) -> &Arc<[ColumnDescriptor]> {
        &self.columns
    }

    /// Expect a new response message on the next call.
    pub fn start_response(&mut self) {
        if self.phase != Phase::Poisoned {
            self.phase = Phase::AwaitingMessage;
            self.pending_error = None;
        }
    }

    /// Whether the current response has been read to its end.
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Whether a fatal error was returned.
    pub fn is_poisoned(&self) -> bool {
        self.phase == Phase::Poisoned
    }

    /// Decode the next event of the current response.
    ///
    /// Returns `Ok(None)` once the response is complete. State changes
    /// carried by the event, packet size included, are applied to `session`
    /// and `framer` before it is returned.
    pub async fn next_event<T>(
        &mut self,
        framer: &mut PacketFramer<T>,
        session: &mut SessionState,
    ) -> Result<Option<ProtocolEvent>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self.advance(framer, session).await {
            Err(err @ Error::Server { .. }) => Err(err),
            Err(err) => {
                tracing::debug!(error = %err, "token stream failed");
                self.phase = Phase::Poisoned;
                self.pending_error = None;
                Err(err)
            }
            ok => ok,
        }
    }

    async fn advance<T>(
        &mut self,
        framer: &mut PacketFramer<T>,
        session: &mut SessionState,
    ) -> Result<Option<ProtocolEvent>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self.phase {
            Phase::Finished | Phase::Poisoned => return Ok(None),
            Phase::AwaitingMessage => {
                let packet_type = framer.begin_read().await?;
                if packet_type != PacketType::TabularResult {
                    return Err(Error::ProtocolViolation(format!(
                        "expected a tabular result, got {packet_type:?}"
                    )));
                }
                self.phase = Phase::Reading;
            }
            Phase::Reading => {}
        }

        loop {
            let reader = framer.reader();
            if reader.is_end_of_message().await? {
                self.phase = Phase::Finished;
                return match self.pending_error.take() {
                    Some(msg) => Err(Error::from_server_message(&msg)),
                    None => Ok(None),
                };
            }

            let token = reader.read_u8().await.map_err(read_error)?;
            let kind = self.table.lookup(token).ok_or_else(|| {
                Error::ProtocolViolation(format!("unexpected token 0x{token:02X}"))
            })?;
            tracing::trace!(token = format_args!("0x{token:02X}"), ?kind, "decoding token");

            let event = match kind {
                TokenKind::ColMetadata => self.read_col_metadata(reader).await?,
                TokenKind::Row => ProtocolEvent::Row(self.read_row(reader, None).await?),
                TokenKind::NbcRow => {
                    let bitmap_len = self.columns.len().div_ceil(8);
                    let bitmap = read_bytes(reader, bitmap_len).await.map_err(read_error)?;
                    ProtocolEvent::NullBitmapRow(self.read_row(reader, Some(&bitmap)).await?)
                }
                TokenKind::Done | TokenKind::DoneProc | TokenKind::DoneInProc => {
                    let mut body = read_bytes(reader, Done::SIZE).await.map_err(read_error)?;
                    let done = Done::decode(&mut body)?;
                    return self.finish_statement(kind, done);
                }
                TokenKind::Error => {
                    let msg = read_server_message(reader).await?;
                    tracing::debug!(
                        number = msg.number,
                        class = msg.class,
                        message = %msg.message,
                        "server error held until DONE"
                    );
                    self.pending_error = Some(msg);
                    continue;
                }
                TokenKind::Info => {
                    let msg = read_server_message(reader).await?;
                    tracing::debug!(number = msg.number, message = %msg.message, "server info message");
                    if let Some(observer) = &self.observer {
                        observer(&msg);
                    }
                    ProtocolEvent::InfoMessage(msg)
                }
                TokenKind::EnvChange => {
                    let mut body = read_short_body(reader).await?;
                    let env = EnvChange::decode_body(&mut body)?;
                    if let EnvEffect::Resize(size) = session.apply_env_change(&env)? {
                        framer.resize(size).await?;
                    }
                    tracing::debug!(env_type = ?env.env_type, "environment change applied");
                    ProtocolEvent::EnvironmentChange(env)
                }
                TokenKind::LoginAck => {
                    let mut body = read_short_body(reader).await?;
                    let ack = LoginAck::decode_body(&mut body)?;
                    session.apply_login_ack(&ack);
                    ProtocolEvent::LoginAck(ack)
                }
                TokenKind::FeatureExtAck => {
                    ProtocolEvent::FeatureExtAck(read_feature_ext_ack(reader).await?)
                }
                TokenKind::ReturnStatus => {
                    ProtocolEvent::ReturnStatus(reader.read_i32_le().await.map_err(read_error)?)
                }
                TokenKind::ReturnValue => {
                    ProtocolEvent::ReturnValue(self.read_return_value(reader).await?)
                }
                TokenKind::Order => {
                    let mut body = read_short_body(reader).await?;
                    ProtocolEvent::Order(Order::decode_body(&mut body)?.columns)
                }
                TokenKind::Sspi => ProtocolEvent::SspiChallenge(read_short_body(reader).await?),
                TokenKind::FedAuthInfo => {
                    let body = read_prefixed(reader, LengthPrefix::U32).await?;
                    ProtocolEvent::FedAuthInfo(FedAuthInfo::decode_body(&body)?)
                }
                TokenKind::Opaque(prefix) => ProtocolEvent::Opaque {
                    token,
                    data: read_prefixed(reader, prefix).await?,
                },
                TokenKind::Skip(prefix) => {
                    let len = read_length(reader, prefix).await?;
                    skip(reader, len).await.map_err(read_error)?;
                    continue;
                }
            };
            return Ok(Some(event));
        }
    }

    fn finish_statement(&mut self, kind: TokenKind, done: Done) -> Result<Option<ProtocolEvent>> {
        // DONEINPROC never closes a response; a procedure ends with DONEPROC.
        if kind != TokenKind::DoneInProc && !done.has_more() {
            self.phase = Phase::Finished;
        }
        tracing::trace!(
            status = done.status.bits(),
            rows = done.row_count,
            more = done.has_more(),
            "statement done"
        );

        if done.is_attention_ack() {
            self.pending_error = None;
        } else if let Some(msg) = self.pending_error.take() {
            return Err(Error::from_server_message(&msg));
        } else if done.is_error() {
            return Err(Error::Server {
                number: 0,
                state: 0,
                class: 0,
                message: "request failed without an error message".into(),
                server: None,
                procedure: None,
                line: 0,
            });
        }

        Ok(Some(match kind {
            TokenKind::DoneProc => ProtocolEvent::DoneProc(done),
            TokenKind::DoneInProc => ProtocolEvent::DoneInProc(done),
            _ => ProtocolEvent::Done(done),
        }))
    }

    async fn read_col_metadata<R>(&mut self, reader: &mut R) -> Result<ProtocolEvent>
    where
        R: AsyncRead + Unpin + Send,
    {
        let count = reader.read_u16_le().await.map_err(read_error)?;
        if count == NO_METADATA {
            return Ok(ProtocolEvent::ColumnMetadata(Arc::clone(&self.columns)));
        }

        let mut columns = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let user_type = reader.read_u32_le().await.map_err(read_error)?;
            let flags = ColumnFlags::from_bits_retain(reader.read_u16_le().await.map_err(read_error)?);
            let type_info = self.registry.read_type_info(&mut *reader).await?;
            let name = read_b_varchar(reader).await.map_err(read_error)?;
            columns.push(ColumnDescriptor {
                user_type,
                flags,
                type_info,
                name,
            });
        }
        tracing::trace!(columns = columns.len(), "column metadata");
        self.columns = Arc::from(columns);
        Ok(ProtocolEvent::ColumnMetadata(Arc::clone(&self.columns)))
    }

    /// Read one value per column; `nulls` is the NBCROW bitmap, LSB first.
    async fn read_row<R>(&self, reader: &mut R, nulls: Option<&[u8]>) -> Result<Vec<Value>>
    where
        R: AsyncRead + Unpin + Send,
    {
        if self.columns.is_empty() {
            return Err(Error::ProtocolViolation("row without column metadata".into()));
        }
        let mut values = Vec::with_capacity(self.columns.len());
        for (i, column) in self.columns.iter().enumerate() {
            let is_null = nulls.is_some_and(|bitmap| bitmap[i / 8] & (1 << (i % 8)) != 0);
            if is_null {
                values.push(Value::Null);
            } else {
                values.push(
                    self.registry
                        .decode_value(&column.type_info, &mut *reader)
                        .await?,
                );
            }
        }
        Ok(values)
    }

    async fn read_return_value<R>(&self, reader: &mut R) -> Result<ReturnValue>
    where
        R: AsyncRead + Unpin + Send,
    {
        let ordinal = reader.read_u16_le().await.map_err(read_error)?;
        let name = read_b_varchar(reader).await.map_err(read_error)?;
        let status = reader.read_u8().await.map_err(read_error)?;
        let user_type = reader.read_u32_le().await.map_err(read_error)?;
        let flags = ColumnFlags::from_bits_retain(reader.read_u16_le().await.map_err(read_error)?);
        let type_info = self.registry.read_type_info(&mut *reader).await?;
        let value = self.registry.decode_value(&type_info, &mut *reader).await?;
        Ok(ReturnValue {
            ordinal,
            name,
            status,
            user_type,
            flags,
            type_info,
            value,
        })
    }
}

impl std::fmt::Debug for TokenDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenDecoder")
            .field("phase", &self.phase)
            .field("columns", &self.columns.len())
            .field("pending_error", &self.pending_error.is_some())
            .finish_non_exhaustive()
    }
}

async fn read_length<R>(reader: &mut R, prefix: LengthPrefix) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let len = match prefix {
        LengthPrefix::U8 => usize::from(reader.read_u8().await.map_err(read_error)?),
        LengthPrefix::U16 => usize::from(reader.read_u16_le().await.map_err(read_error)?),
        LengthPrefix::U32 => reader.read_u32_le().await.map_err(read_error)? as usize,
    };
    if len > MAX_LONG_TOKEN {
        return Err(Error::ProtocolViolation(format!("token body of {len} bytes")));
    }
    Ok(len)
}

async fn read_prefixed<R>(reader: &mut R, prefix: LengthPrefix) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = read_length(reader, prefix).await?;
    read_bytes(reader, len).await.map_err(read_error)
}

async fn read_short_body<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    read_prefixed(reader, LengthPrefix::U16).await
}

async fn read_server_message<R>(reader: &mut R) -> Result<ServerMessage>
where
    R: AsyncRead + Unpin,
{
    let mut body = read_short_body(reader).await?;
    Ok(ServerMessage::decode_body(&mut body)?)
}

async fn read_feature_ext_ack<R>(reader: &mut R) -> Result<FeatureExtAck>
where
    R: AsyncRead + Unpin,
{
    let mut features = Vec::new();
    loop {
        let id = reader.read_u8().await.map_err(read_error)?;
        if id == FEATURE_TERMINATOR {
            return Ok(FeatureExtAck { features });
        }
        let data = read_prefixed(reader, LengthPrefix::U32).await?;
        features.push((id, data));
    }
}
