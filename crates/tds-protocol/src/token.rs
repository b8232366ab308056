//! Token stream record definitions.
//!
//! Every response message is a sequence of tokens, each introduced by a
//! one-byte token id. This module holds the self-contained records, i.e. the
//! ones that can be decoded without knowing the current result-set metadata.
//! Column metadata and rows need a type registry and are decoded by the
//! client's token decoder.
//!
//! ## Length conventions
//!
//! Most variable-length tokens carry a `u16` length right after the token
//! id. For those, `decode` consumes the length prefix and `decode_body` takes
//! only the bytes it covers, so a streaming reader can fetch exactly `length`
//! bytes and hand them over. `Done`, `ReturnStatus` and `FeatureExtAck` have
//! no length prefix.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{
    decode_ucs2, encode_ucs2, read_b_varbyte, read_b_varchar, read_ucs2, read_us_varchar,
    write_b_varbyte, write_b_varchar, write_us_varchar,
};
use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// Token identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Stored procedure return status.
    ReturnStatus = 0x79,
    /// Result-set column metadata.
    ColMetaData = 0x81,
    /// ORDER BY column list.
    Order = 0xA9,
    /// Server error message.
    Error = 0xAA,
    /// Server informational message.
    Info = 0xAB,
    /// Output parameter value.
    ReturnValue = 0xAC,
    /// Login acknowledgement.
    LoginAck = 0xAD,
    /// Feature extension acknowledgement.
    FeatureExtAck = 0xAE,
    /// Row of values.
    Row = 0xD1,
    /// Row with a leading null bitmap.
    NbcRow = 0xD2,
    /// Environment change.
    EnvChange = 0xE3,
    /// SSPI challenge.
    Sspi = 0xED,
    /// Federated authentication parameters.
    FedAuthInfo = 0xEE,
    /// End of a statement.
    Done = 0xFD,
    /// End of a stored procedure.
    DoneProc = 0xFE,
    /// End of a statement inside a stored procedure.
    DoneInProc = 0xFF,
}

impl TokenType {
    /// Look up a token id.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x79 => Self::ReturnStatus,
            0x81 => Self::ColMetaData,
            0xA9 => Self::Order,
            0xAA => Self::Error,
            0xAB => Self::Info,
            0xAC => Self::ReturnValue,
            0xAD => Self::LoginAck,
            0xAE => Self::FeatureExtAck,
            0xD1 => Self::Row,
            0xD2 => Self::NbcRow,
            0xE3 => Self::EnvChange,
            0xED => Self::Sspi,
            0xEE => Self::FedAuthInfo,
            0xFD => Self::Done,
            0xFE => Self::DoneProc,
            0xFF => Self::DoneInProc,
            _ => return None,
        })
    }
}

/// Column count marking "no metadata" in COLMETADATA.
pub const NO_METADATA: u16 = 0xFFFF;

fn ensure(src: &impl Buf, needed: usize) -> Result<(), ProtocolError> {
    if src.remaining() < needed {
        return Err(ProtocolError::IncompletePacket {
            expected: needed,
            actual: src.remaining(),
        });
    }
    Ok(())
}

fn split_u16_body(src: &mut impl Buf) -> Result<Bytes, ProtocolError> {
    ensure(src, 2)?;
    let len = src.get_u16_le() as usize;
    ensure(src, len)?;
    Ok(src.copy_to_bytes(len))
}

fn finish_u16_body(token: TokenType, body: &[u8], dst: &mut impl BufMut) -> Result<(), ProtocolError> {
    let len = u16::try_from(body.len()).map_err(|_| ProtocolError::ValueTooLarge {
        field: "token body",
        len: body.len(),
        max: u16::MAX as usize,
    })?;
    dst.put_u8(token as u8);
    dst.put_u16_le(len);
    dst.put_slice(body);
    Ok(())
}

// =============================================================================
// Done
// =============================================================================

bitflags! {
    /// Status bits of DONE, DONEPROC and DONEINPROC.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct DoneStatus: u16 {
        /// More results follow in this message.
        const MORE = 0x0001;
        /// The statement failed.
        const ERROR = 0x0002;
        /// A transaction is in progress.
        const IN_XACT = 0x0004;
        /// `row_count` is valid.
        const COUNT = 0x0010;
        /// Acknowledges an attention request.
        const ATTN = 0x0020;
        /// A server error terminated the statement.
        const SRV_ERROR = 0x0100;
    }
}

/// Body of DONE, DONEPROC and DONEINPROC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Done {
    /// Status bits.
    pub status: DoneStatus,
    /// Token of the command that completed.
    pub cur_cmd: u16,
    /// Affected row count, valid when `COUNT` is set.
    pub row_count: u64,
}

impl Done {
    /// Body size.
    pub const SIZE: usize = 12;

    /// Final DONE of a message.
    #[must_use]
    pub fn new(status: DoneStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// DONE carrying a row count.
    #[must_use]
    pub fn with_count(mut self, row_count: u64) -> Self {
        self.status |= DoneStatus::COUNT;
        self.row_count = row_count;
        self
    }

    /// Decode the 12-byte body.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, Self::SIZE)?;
        Ok(Self {
            // Unknown bits are carried by newer servers; keep what we know.
            status: DoneStatus::from_bits_truncate(src.get_u16_le()),
            cur_cmd: src.get_u16_le(),
            row_count: src.get_u64_le(),
        })
    }

    /// Encode with the given token id.
    pub fn encode(&self, token: TokenType, dst: &mut impl BufMut) {
        dst.put_u8(token as u8);
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_u64_le(self.row_count);
    }

    /// Whether more results follow.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// Whether the ERROR or SRVERROR bit is set.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.status.intersects(DoneStatus::ERROR.union(DoneStatus::SRV_ERROR))
    }

    /// Whether this acknowledges an attention.
    #[must_use]
    pub const fn is_attention_ack(&self) -> bool {
        self.status.contains(DoneStatus::ATTN)
    }

    /// Row count if the COUNT bit is set.
    #[must_use]
    pub const fn rows(&self) -> Option<u64> {
        if self.status.contains(DoneStatus::COUNT) {
            Some(self.row_count)
        } else {
            None
        }
    }
}

// =============================================================================
// Error / Info
// =============================================================================

/// Body of an ERROR or INFO token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Name of the server that raised it.
    pub server: String,
    /// Procedure name, empty outside a procedure.
    pub procedure: String,
    /// Line number within the batch or procedure.
    pub line: i32,
}

impl ServerMessage {
    /// Decode a token, length prefix included.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut body = split_u16_body(src)?;
        Self::decode_body(&mut body)
    }

    /// Decode the bytes covered by the length prefix.
    pub fn decode_body(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 6)?;
        let number = src.get_i32_le();
        let state = src.get_u8();
        let class = src.get_u8();
        let message = read_us_varchar(src)?;
        let server = read_b_varchar(src)?;
        let procedure = read_b_varchar(src)?;
        ensure(src, 4)?;
        let line = src.get_i32_le();
        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }

    /// Encode as an ERROR or INFO token.
    pub fn encode(&self, token: TokenType, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        body.put_i32_le(self.number);
        body.put_u8(self.state);
        body.put_u8(self.class);
        write_us_varchar(&mut body, &self.message)?;
        write_b_varchar(&mut body, &self.server)?;
        write_b_varchar(&mut body, &self.procedure)?;
        body.put_i32_le(self.line);
        finish_u16_body(token, &body, dst)
    }

    /// Severity 20 and above terminates the connection.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= 20
    }
}

// =============================================================================
// LoginAck
// =============================================================================

/// Body of a LOGINACK token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// SQL interface type, 1 for T-SQL.
    pub interface: u8,
    /// TDS version the server selected.
    pub tds_version: TdsVersion,
    /// Server program name.
    pub prog_name: String,
    /// Server program version: major, minor, build high, build low.
    pub prog_version: [u8; 4],
}

impl LoginAck {
    /// Decode a token, length prefix included.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut body = split_u16_body(src)?;
        Self::decode_body(&mut body)
    }

    /// Decode the bytes covered by the length prefix.
    pub fn decode_body(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 5)?;
        let interface = src.get_u8();
        let tds_version = TdsVersion::new(src.get_u32());
        let prog_name = read_b_varchar(src)?;
        ensure(src, 4)?;
        let mut prog_version = [0u8; 4];
        src.copy_to_slice(&mut prog_version);
        Ok(Self {
            interface,
            tds_version,
            prog_name,
            prog_version,
        })
    }

    /// Encode the token.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        body.put_u8(self.interface);
        body.put_u32(self.tds_version.raw());
        write_b_varchar(&mut body, &self.prog_name)?;
        body.put_slice(&self.prog_version);
        finish_u16_body(TokenType::LoginAck, &body, dst)
    }

    /// Program version as `major.minor.build`.
    #[must_use]
    pub fn version_string(&self) -> String {
        let [major, minor, hi, lo] = self.prog_version;
        format!("{major}.{minor}.{}", u16::from_be_bytes([hi, lo]))
    }
}

// =============================================================================
// EnvChange
// =============================================================================

/// Environment change discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvChangeType {
    /// Current database.
    Database = 1,
    /// Session language.
    Language = 2,
    /// Character set.
    CharacterSet = 3,
    /// Negotiated packet size.
    PacketSize = 4,
    /// Unicode sorting locale id.
    SortLocale = 5,
    /// Unicode comparison flags.
    SortFlags = 6,
    /// Default collation.
    SqlCollation = 7,
    /// Transaction started.
    BeginTransaction = 8,
    /// Transaction committed.
    CommitTransaction = 9,
    /// Transaction rolled back.
    RollbackTransaction = 10,
    /// Enlisted in a DTC transaction.
    EnlistDtcTransaction = 11,
    /// Defected from a DTC transaction.
    DefectTransaction = 12,
    /// Database mirroring partner.
    RealTimeLogShipping = 13,
    /// Transaction promoted to DTC.
    PromoteTransaction = 15,
    /// Transaction manager address.
    TransactionManagerAddress = 16,
    /// Transaction ended.
    TransactionEnded = 17,
    /// Connection reset acknowledged.
    ResetConnectionAck = 18,
    /// User instance name.
    UserInstance = 19,
    /// Redirect to another server.
    Routing = 20,
}

impl EnvChangeType {
    /// Look up a discriminant.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            1 => Self::Database,
            2 => Self::Language,
            3 => Self::CharacterSet,
            4 => Self::PacketSize,
            5 => Self::SortLocale,
            6 => Self::SortFlags,
            7 => Self::SqlCollation,
            8 => Self::BeginTransaction,
            9 => Self::CommitTransaction,
            10 => Self::RollbackTransaction,
            11 => Self::EnlistDtcTransaction,
            12 => Self::DefectTransaction,
            13 => Self::RealTimeLogShipping,
            15 => Self::PromoteTransaction,
            16 => Self::TransactionManagerAddress,
            17 => Self::TransactionEnded,
            18 => Self::ResetConnectionAck,
            19 => Self::UserInstance,
            20 => Self::Routing,
            other => return Err(ProtocolError::UnknownEnvChange(other)),
        })
    }

    fn layout(self) -> EnvLayout {
        match self {
            Self::Database
            | Self::Language
            | Self::CharacterSet
            | Self::PacketSize
            | Self::SortLocale
            | Self::SortFlags
            | Self::RealTimeLogShipping
            | Self::UserInstance => EnvLayout::Text,
            Self::PromoteTransaction => EnvLayout::LongBinary,
            Self::Routing => EnvLayout::Routing,
            _ => EnvLayout::Binary,
        }
    }

    /// Layout of the old value, which differs from the new one for a promote.
    fn old_layout(self) -> EnvLayout {
        match self {
            Self::PromoteTransaction => EnvLayout::Binary,
            other => other.layout(),
        }
    }
}

#[derive(Clone, Copy)]
enum EnvLayout {
    Text,
    Binary,
    LongBinary,
    Routing,
}

/// Target of a routing environment change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTarget {
    /// Transport protocol, 0 for TCP.
    pub protocol: u8,
    /// Port number.
    pub port: u16,
    /// Host name.
    pub host: String,
}

/// One side of an environment change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChangeValue {
    /// B_VARCHAR value.
    Text(String),
    /// B_VARBYTE (or L_VARBYTE for promotion) value.
    Binary(Bytes),
    /// Routing record.
    Routing(RoutingTarget),
}

impl EnvChangeValue {
    /// Empty value for the given layout.
    fn empty(layout: EnvLayout) -> Self {
        match layout {
            EnvLayout::Text => Self::Text(String::new()),
            _ => Self::Binary(Bytes::new()),
        }
    }

    /// Text content, if any.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Binary content, if any.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// Body of an ENVCHANGE token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange {
    /// Discriminant.
    pub env_type: EnvChangeType,
    /// New value.
    pub new_value: EnvChangeValue,
    /// Old value.
    pub old_value: EnvChangeValue,
}

impl EnvChange {
    /// Text change, e.g. database or language.
    #[must_use]
    pub fn text(env_type: EnvChangeType, new: impl Into<String>, old: impl Into<String>) -> Self {
        Self {
            env_type,
            new_value: EnvChangeValue::Text(new.into()),
            old_value: EnvChangeValue::Text(old.into()),
        }
    }

    /// Packet size change.
    #[must_use]
    pub fn packet_size(new: u32, old: u32) -> Self {
        Self::text(EnvChangeType::PacketSize, new.to_string(), old.to_string())
    }

    /// Transaction change carrying a descriptor on the side the protocol
    /// puts it: new for begin, old for commit, rollback and end.
    #[must_use]
    pub fn transaction(env_type: EnvChangeType, descriptor: u64) -> Self {
        let value = EnvChangeValue::Binary(Bytes::copy_from_slice(&descriptor.to_le_bytes()));
        let empty = EnvChangeValue::Binary(Bytes::new());
        let (new_value, old_value) = if env_type == EnvChangeType::BeginTransaction {
            (value, empty)
        } else {
            (empty, value)
        };
        Self {
            env_type,
            new_value,
            old_value,
        }
    }

    /// Routing change.
    #[must_use]
    pub fn routing(host: impl Into<String>, port: u16) -> Self {
        Self {
            env_type: EnvChangeType::Routing,
            new_value: EnvChangeValue::Routing(RoutingTarget {
                protocol: 0,
                port,
                host: host.into(),
            }),
            old_value: EnvChangeValue::Binary(Bytes::new()),
        }
    }

    /// Decode a token, length prefix included.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut body = split_u16_body(src)?;
        Self::decode_body(&mut body)
    }

    /// Decode the bytes covered by the length prefix.
    ///
    /// An unknown discriminant is an error: its value layout is unknown, so
    /// nothing after it can be trusted.
    pub fn decode_body(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 1)?;
        let env_type = EnvChangeType::from_u8(src.get_u8())?;
        let new_value = Self::read_value(src, env_type.layout())?;
        let old_layout = env_type.old_layout();
        let old_value = if src.has_remaining() {
            Self::read_value(src, old_layout)?
        } else {
            EnvChangeValue::empty(old_layout)
        };
        Ok(Self {
            env_type,
            new_value,
            old_value,
        })
    }

    fn read_value(src: &mut impl Buf, layout: EnvLayout) -> Result<EnvChangeValue, ProtocolError> {
        Ok(match layout {
            EnvLayout::Text => EnvChangeValue::Text(read_b_varchar(src)?),
            EnvLayout::Binary => EnvChangeValue::Binary(read_b_varbyte(src)?),
            EnvLayout::LongBinary => {
                ensure(src, 4)?;
                let len = src.get_u32_le() as usize;
                ensure(src, len)?;
                EnvChangeValue::Binary(src.copy_to_bytes(len))
            }
            EnvLayout::Routing => {
                ensure(src, 2)?;
                let len = src.get_u16_le() as usize;
                if len == 0 {
                    return Ok(EnvChangeValue::Binary(Bytes::new()));
                }
                ensure(src, len)?;
                let mut record = src.copy_to_bytes(len);
                ensure(&record, 5)?;
                let protocol = record.get_u8();
                let port = record.get_u16_le();
                let chars = record.get_u16_le() as usize;
                let host = read_ucs2(&mut record, chars)?;
                EnvChangeValue::Routing(RoutingTarget {
                    protocol,
                    port,
                    host,
                })
            }
        })
    }

    fn write_value(
        dst: &mut BytesMut,
        layout: EnvLayout,
        value: &EnvChangeValue,
    ) -> Result<(), ProtocolError> {
        match (layout, value) {
            (EnvLayout::Text, EnvChangeValue::Text(s)) => write_b_varchar(dst, s),
            (EnvLayout::LongBinary, EnvChangeValue::Binary(b)) => {
                dst.put_u32_le(b.len() as u32);
                dst.put_slice(b);
                Ok(())
            }
            (EnvLayout::Routing, EnvChangeValue::Routing(target)) => {
                let host = encode_ucs2(&target.host);
                let record_len = 5 + host.len();
                let len = u16::try_from(record_len).map_err(|_| ProtocolError::ValueTooLarge {
                    field: "routing host",
                    len: record_len,
                    max: u16::MAX as usize,
                })?;
                dst.put_u16_le(len);
                dst.put_u8(target.protocol);
                dst.put_u16_le(target.port);
                dst.put_u16_le((host.len() / 2) as u16);
                dst.put_slice(&host);
                Ok(())
            }
            (EnvLayout::Routing, EnvChangeValue::Binary(_)) => {
                dst.put_u16_le(0);
                Ok(())
            }
            (_, EnvChangeValue::Binary(b)) => write_b_varbyte(dst, b),
            (_, EnvChangeValue::Text(s)) => write_b_varchar(dst, s),
            (_, EnvChangeValue::Routing(_)) => Err(ProtocolError::InvalidField {
                field: "envchange value",
                value: 0,
            }),
        }
    }

    /// Encode the token.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        body.put_u8(self.env_type as u8);
        Self::write_value(&mut body, self.env_type.layout(), &self.new_value)?;
        Self::write_value(&mut body, self.env_type.old_layout(), &self.old_value)?;
        finish_u16_body(TokenType::EnvChange, &body, dst)
    }

    /// New packet size, for a packet size change.
    pub fn new_packet_size(&self) -> Result<Option<u32>, ProtocolError> {
        if self.env_type != EnvChangeType::PacketSize {
            return Ok(None);
        }
        let text = self.new_value.as_text().unwrap_or_default();
        text.trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| ProtocolError::StringEncoding(format!("invalid packet size {text:?}")))
    }

    /// Transaction descriptor carried by a transaction change.
    #[must_use]
    pub fn transaction_descriptor(&self) -> Option<u64> {
        let value = match self.env_type {
            EnvChangeType::BeginTransaction => &self.new_value,
            EnvChangeType::CommitTransaction
            | EnvChangeType::RollbackTransaction
            | EnvChangeType::EnlistDtcTransaction
            | EnvChangeType::TransactionEnded => &self.old_value,
            _ => return None,
        };
        let bytes = value.as_bytes()?;
        let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(raw))
    }

    /// Routing target, for a routing change.
    #[must_use]
    pub fn routing_target(&self) -> Option<&RoutingTarget> {
        match &self.new_value {
            EnvChangeValue::Routing(target) => Some(target),
            _ => None,
        }
    }

    /// New collation, for a collation change.
    #[must_use]
    pub fn new_collation(&self) -> Option<Collation> {
        if self.env_type != EnvChangeType::SqlCollation {
            return None;
        }
        let mut bytes = self.new_value.as_bytes()?.clone();
        Collation::decode(&mut bytes).ok()
    }
}

// =============================================================================
// Collation
// =============================================================================

/// Five-byte collation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Collation {
    /// LCID in the low 20 bits, comparison flags and version above.
    pub info: u32,
    /// SQL sort id, 0 for Windows collations.
    pub sort_id: u8,
}

impl Collation {
    /// Encoded size.
    pub const SIZE: usize = 5;

    /// Windows locale id.
    #[must_use]
    pub const fn lcid(&self) -> u32 {
        self.info & 0x000F_FFFF
    }

    /// Decode the five bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, Self::SIZE)?;
        Ok(Self {
            info: src.get_u32_le(),
            sort_id: src.get_u8(),
        })
    }

    /// Encode the five bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.info);
        dst.put_u8(self.sort_id);
    }
}

// =============================================================================
// Smaller tokens
// =============================================================================

/// Body of an ORDER token: one-based column ordinals.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Order {
    /// Ordered column ordinals.
    pub columns: Vec<u16>,
}

impl Order {
    /// Decode the bytes covered by the length prefix.
    pub fn decode_body(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut columns = Vec::with_capacity(src.remaining() / 2);
        while src.remaining() >= 2 {
            columns.push(src.get_u16_le());
        }
        Ok(Self { columns })
    }

    /// Decode a token, length prefix included.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut body = split_u16_body(src)?;
        Self::decode_body(&mut body)
    }
}

/// Body of a FEATUREEXTACK token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeatureExtAck {
    /// Acknowledged features as `(id, data)`.
    pub features: Vec<(u8, Bytes)>,
}

impl FeatureExtAck {
    /// Decode up to and including the terminator.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut features = Vec::new();
        loop {
            ensure(src, 1)?;
            let id = src.get_u8();
            if id == crate::feature_ext::FEATURE_TERMINATOR {
                return Ok(Self { features });
            }
            ensure(src, 4)?;
            let len = src.get_u32_le() as usize;
            ensure(src, len)?;
            features.push((id, src.copy_to_bytes(len)));
        }
    }

    /// Encode the token.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(TokenType::FeatureExtAck as u8);
        for (id, data) in &self.features {
            dst.put_u8(*id);
            dst.put_u32_le(data.len() as u32);
            dst.put_slice(data);
        }
        dst.put_u8(crate::feature_ext::FEATURE_TERMINATOR);
    }
}

/// Encode an SSPI token carrying a challenge.
pub fn encode_sspi(data: &[u8], dst: &mut impl BufMut) -> Result<(), ProtocolError> {
    finish_u16_body(TokenType::Sspi, data, dst)
}

/// Encode a RETURNSTATUS token.
pub fn encode_return_status(status: i32, dst: &mut impl BufMut) {
    dst.put_u8(TokenType::ReturnStatus as u8);
    dst.put_i32_le(status);
}

/// Body of a FEDAUTHINFO token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FedAuthInfo {
    /// Token service URL.
    pub sts_url: String,
    /// Service principal name.
    pub spn: String,
}

impl FedAuthInfo {
    const STS_URL: u8 = 0x01;
    const SPN: u8 = 0x02;
    const OPTION_SIZE: usize = 9;

    /// Decode the bytes covered by the `u32` length prefix.
    ///
    /// Option data offsets are relative to the start of the body.
    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut src = body;
        ensure(&src, 4)?;
        let count = src.get_u32_le() as usize;
        let mut info = Self::default();
        for _ in 0..count {
            ensure(&src, Self::OPTION_SIZE)?;
            let id = src.get_u8();
            let len = src.get_u32_le() as usize;
            let offset = src.get_u32_le() as usize;
            let data = offset
                .checked_add(len)
                .and_then(|end| body.get(offset..end))
                .ok_or(ProtocolError::InvalidField {
                    field: "fedauthinfo offset",
                    value: offset as u32,
                })?;
            match id {
                Self::STS_URL => info.sts_url = decode_ucs2(data)?,
                Self::SPN => info.spn = decode_ucs2(data)?,
                _ => {}
            }
        }
        Ok(info)
    }

    /// Decode a token, length prefix included.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 4)?;
        let len = src.get_u32_le() as usize;
        ensure(src, len)?;
        let body = src.copy_to_bytes(len);
        Self::decode_body(&body)
    }

    /// Encode the token.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let sts = encode_ucs2(&self.sts_url);
        let spn = encode_ucs2(&self.spn);
        let data_start = 4 + 2 * Self::OPTION_SIZE;
        let mut body = BytesMut::new();
        body.put_u32_le(2);
        body.put_u8(Self::STS_URL);
        body.put_u32_le(sts.len() as u32);
        body.put_u32_le(data_start as u32);
        body.put_u8(Self::SPN);
        body.put_u32_le(spn.len() as u32);
        body.put_u32_le((data_start + sts.len()) as u32);
        body.put_slice(&sts);
        body.put_slice(&spn);

        dst.put_u8(TokenType::FedAuthInfo as u8);
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn strip_token_id(buf: &BytesMut, expected: TokenType) -> Bytes {
        assert_eq!(buf[0], expected as u8);
        Bytes::copy_from_slice(&buf[1..])
    }

    #[test]
    fn test_token_type_lookup() {
        assert_eq!(TokenType::from_u8(0xFD), Some(TokenType::Done));
        assert_eq!(TokenType::from_u8(0xD2), Some(TokenType::NbcRow));
        assert_eq!(TokenType::from_u8(0x00), None);
    }

    #[test]
    fn test_done_decode() {
        // DONE | COUNT, cur_cmd 0xC1, 5 rows
        let data: &[u8] = &[0x10, 0x00, 0xC1, 0x00, 5, 0, 0, 0, 0, 0, 0, 0];
        let mut cursor = data;
        let done = Done::decode(&mut cursor).unwrap();
        assert_eq!(done.status, DoneStatus::COUNT);
        assert_eq!(done.cur_cmd, 0xC1);
        assert_eq!(done.rows(), Some(5));
        assert!(!done.has_more());
        assert!(!done.is_error());
    }

    #[test]
    fn test_done_error_bits() {
        assert!(Done::new(DoneStatus::ERROR).is_error());
        assert!(Done::new(DoneStatus::SRV_ERROR).is_error());
        assert!(Done::new(DoneStatus::ATTN).is_attention_ack());
        assert_eq!(Done::new(DoneStatus::MORE).rows(), None);
    }

    #[test]
    fn test_done_short_input() {
        let data: &[u8] = &[0x00, 0x00, 0x00];
        let mut cursor = data;
        assert!(matches!(
            Done::decode(&mut cursor),
            Err(ProtocolError::IncompletePacket { expected: 12, .. })
        ));
    }

    #[test]
    fn test_server_message_roundtrip() {
        let msg = ServerMessage {
            number: 547,
            state: 0,
            class: 16,
            message: "constraint violation".into(),
            server: "db01".into(),
            procedure: "p".into(),
            line: 3,
        };
        let mut buf = BytesMut::new();
        msg.encode(TokenType::Error, &mut buf).unwrap();
        let mut body = strip_token_id(&buf, TokenType::Error);
        assert_eq!(ServerMessage::decode(&mut body).unwrap(), msg);
        assert!(!body.has_remaining());
    }

    #[test]
    fn test_login_ack_version_is_big_endian() {
        let ack = LoginAck {
            interface: 1,
            tds_version: TdsVersion::V7_4,
            prog_name: "Microsoft SQL Server".into(),
            prog_version: [16, 0, 0x0F, 0xA0],
        };
        let mut buf = BytesMut::new();
        ack.encode(&mut buf).unwrap();
        assert_eq!(&buf[4..8], &[0x74, 0x00, 0x00, 0x04]);

        let mut body = strip_token_id(&buf, TokenType::LoginAck);
        let decoded = LoginAck::decode(&mut body).unwrap();
        assert_eq!(decoded, ack);
        assert_eq!(decoded.version_string(), "16.0.4000");
    }

    #[test]
    fn test_env_change_database() {
        let change = EnvChange::text(EnvChangeType::Database, "sales", "master");
        let mut buf = BytesMut::new();
        change.encode(&mut buf).unwrap();
        let mut body = strip_token_id(&buf, TokenType::EnvChange);
        let decoded = EnvChange::decode(&mut body).unwrap();
        assert_eq!(decoded.new_value.as_text(), Some("sales"));
        assert_eq!(decoded.old_value.as_text(), Some("master"));
    }

    #[test]
    fn test_env_change_packet_size() {
        let change = EnvChange::packet_size(8192, 4096);
        let mut buf = BytesMut::new();
        change.encode(&mut buf).unwrap();
        let mut body = strip_token_id(&buf, TokenType::EnvChange);
        let decoded = EnvChange::decode(&mut body).unwrap();
        assert_eq!(decoded.new_packet_size().unwrap(), Some(8192));
    }

    #[test]
    fn test_env_change_transactions() {
        let begin = EnvChange::transaction(EnvChangeType::BeginTransaction, 0xABCD);
        assert_eq!(begin.transaction_descriptor(), Some(0xABCD));

        let mut buf = BytesMut::new();
        EnvChange::transaction(EnvChangeType::CommitTransaction, 0xABCD)
            .encode(&mut buf)
            .unwrap();
        let mut body = strip_token_id(&buf, TokenType::EnvChange);
        let commit = EnvChange::decode(&mut body).unwrap();
        assert_eq!(commit.env_type, EnvChangeType::CommitTransaction);
        assert_eq!(commit.new_value.as_bytes().map(Bytes::len), Some(0));
        assert_eq!(commit.transaction_descriptor(), Some(0xABCD));
    }

    #[test]
    fn test_env_change_routing() {
        let mut buf = BytesMut::new();
        EnvChange::routing("replica.local", 11433)
            .encode(&mut buf)
            .unwrap();
        let mut body = strip_token_id(&buf, TokenType::EnvChange);
        let decoded = EnvChange::decode(&mut body).unwrap();
        let target = decoded.routing_target().unwrap();
        assert_eq!(target.host, "replica.local");
        assert_eq!(target.port, 11433);
        assert_eq!(target.protocol, 0);
    }

    #[test]
    fn test_env_change_unknown_type_is_error() {
        let data: &[u8] = &[0x03, 0x00, 14, 0x00, 0x00];
        let mut cursor = data;
        assert_eq!(
            EnvChange::decode(&mut cursor),
            Err(ProtocolError::UnknownEnvChange(14))
        );
    }

    #[test]
    fn test_env_change_promote_transaction() {
        // New value is L_VARBYTE, old value a single zero length byte.
        let data: &[u8] = &[15, 0x03, 0x00, 0x00, 0x00, 0xAA, 0xBB, 0xCC, 0x00];
        let mut cursor = data;
        let change = EnvChange::decode_body(&mut cursor).unwrap();
        assert_eq!(change.env_type, EnvChangeType::PromoteTransaction);
        assert_eq!(
            change.new_value.as_bytes().map(|b| &b[..]),
            Some(&[0xAA, 0xBB, 0xCC][..])
        );
        assert_eq!(change.old_value.as_bytes().map(Bytes::len), Some(0));
        assert!(cursor.is_empty());

        let mut encoded = BytesMut::new();
        change.encode(&mut encoded).unwrap();
        assert_eq!(&encoded[3..], data);
    }

    #[test]
    fn test_env_change_collation() {
        let collation = Collation {
            info: 0x00D0_0409,
            sort_id: 0x34,
        };
        let mut raw = BytesMut::new();
        collation.encode(&mut raw);
        let change = EnvChange {
            env_type: EnvChangeType::SqlCollation,
            new_value: EnvChangeValue::Binary(raw.freeze()),
            old_value: EnvChangeValue::Binary(Bytes::new()),
        };
        let parsed = change.new_collation().unwrap();
        assert_eq!(parsed, collation);
        assert_eq!(parsed.lcid(), 0x0409);
    }

    #[test]
    fn test_fed_auth_info_roundtrip() {
        let info = FedAuthInfo {
            sts_url: "https://login.example/tenant".into(),
            spn: "https://database.example/".into(),
        };
        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        let mut body = strip_token_id(&buf, TokenType::FedAuthInfo);
        assert_eq!(FedAuthInfo::decode(&mut body).unwrap(), info);
    }

    #[test]
    fn test_fed_auth_info_bad_offset() {
        let mut body = BytesMut::new();
        body.put_u32_le(1);
        body.put_u8(0x02);
        body.put_u32_le(4);
        body.put_u32_le(200);
        assert!(FedAuthInfo::decode_body(&body).is_err());
    }

    #[test]
    fn test_feature_ext_ack() {
        let ack = FeatureExtAck {
            features: vec![(0x02, Bytes::from_static(&[1, 2]))],
        };
        let mut buf = BytesMut::new();
        ack.encode(&mut buf);
        let mut body = strip_token_id(&buf, TokenType::FeatureExtAck);
        assert_eq!(FeatureExtAck::decode(&mut body).unwrap(), ack);
    }

    #[test]
    fn test_order() {
        let data: &[u8] = &[0x04, 0x00, 0x01, 0x00, 0x03, 0x00];
        let mut cursor = data;
        assert_eq!(Order::decode(&mut cursor).unwrap().columns, vec![1, 3]);
    }
}
