//! Protocol events yielded by the token decoder.

use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use tds_protocol::token::{Done, EnvChange, FeatureExtAck, FedAuthInfo, LoginAck, ServerMessage};
use tds_types::{TypeDescriptor, Value};

bitflags! {
    /// Column flags from COLMETADATA.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct ColumnFlags: u16 {
        /// The column accepts NULL.
        const NULLABLE = 0x0001;
        /// Comparisons are case sensitive.
        const CASE_SENSITIVE = 0x0002;
        /// The column is writable.
        const UPDATEABLE = 0x0004;
        /// Writability is unknown.
        const UPDATEABLE_UNKNOWN = 0x0008;
        /// Identity column.
        const IDENTITY = 0x0010;
        /// Computed column.
        const COMPUTED = 0x0020;
        /// Fixed-length CLR type.
        const FIXED_LEN_CLR = 0x0100;
        /// Sparse column set.
        const SPARSE_COLUMN_SET = 0x0400;
        /// Always Encrypted column.
        const ENCRYPTED = 0x0800;
        /// Hidden (browse-mode key) column.
        const HIDDEN = 0x2000;
        /// Part of a key.
        const KEY = 0x4000;
        /// Nullability is unknown.
        const NULLABLE_UNKNOWN = 0x8000;
    }
}

/// One column of a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    /// User type id.
    pub user_type: u32,
    /// Column flags.
    pub flags: ColumnFlags,
    /// Type as read by the registry.
    pub type_info: TypeDescriptor,
    /// Column name, possibly empty.
    pub name: String,
}

impl ColumnDescriptor {
    /// Whether the column accepts NULL.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.flags.contains(ColumnFlags::NULLABLE)
    }
}

/// Output parameter or UDF return value.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnValue {
    /// Parameter ordinal.
    pub ordinal: u16,
    /// Parameter name, `@` included.
    pub name: String,
    /// 0x01 for an output parameter, 0x02 for a UDF return value.
    pub status: u8,
    /// User type id.
    pub user_type: u32,
    /// Parameter flags.
    pub flags: ColumnFlags,
    /// Type as read by the registry.
    pub type_info: TypeDescriptor,
    /// Decoded value.
    pub value: Value,
}

/// A decoded token.
///
/// ERROR tokens never appear here: they are held until the DONE that ends
/// the failing statement and surface as [`Error::Server`](crate::Error::Server).
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ProtocolEvent {
    /// A new result set; later rows follow this metadata.
    ColumnMetadata(Arc<[ColumnDescriptor]>),
    /// A row.
    Row(Vec<Value>),
    /// A row that arrived null-compressed.
    NullBitmapRow(Vec<Value>),
    /// Procedure return status.
    ReturnStatus(i32),
    /// Output parameter.
    ReturnValue(ReturnValue),
    /// ORDER BY column ordinals of the current result set.
    Order(Vec<u16>),
    /// Login accepted.
    LoginAck(LoginAck),
    /// Session state changed; already applied to the session.
    EnvironmentChange(EnvChange),
    /// Informational message.
    InfoMessage(ServerMessage),
    /// Acknowledged feature extensions.
    FeatureExtAck(FeatureExtAck),
    /// Statement completed.
    Done(Done),
    /// Stored procedure completed.
    DoneProc(Done),
    /// Statement inside a procedure completed.
    DoneInProc(Done),
    /// SSPI challenge for the integrated-auth exchange.
    SspiChallenge(Bytes),
    /// Where to fetch a federated token.
    FedAuthInfo(FedAuthInfo),
    /// A token registered as opaque, with its raw body.
    Opaque {
        /// Token id.
        token: u8,
        /// Body without the length prefix.
        data: Bytes,
    },
}

impl ProtocolEvent {
    /// DONE-family body, if this is one.
    #[must_use]
    pub fn as_done(&self) -> Option<&Done> {
        match self {
            Self::Done(done) | Self::DoneProc(done) | Self::DoneInProc(done) => Some(done),
            _ => None,
        }
    }

    /// Row values, null-compressed or not.
    #[must_use]
    pub fn as_row(&self) -> Option<&[Value]> {
        match self {
            Self::Row(values) | Self::NullBitmapRow(values) => Some(values),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tds_protocol::token::DoneStatus;

    #[test]
    fn test_done_family_accessor() {
        let done = Done::new(DoneStatus::MORE);
        assert!(ProtocolEvent::DoneInProc(done).as_done().unwrap_or(&Done::default()).has_more());
        assert!(ProtocolEvent::ReturnStatus(0).as_done().is_none());
    }

    #[test]
    fn test_row_accessor() {
        let row = ProtocolEvent::NullBitmapRow(vec![Value::Null, Value::Int(1)]);
        assert_eq!(row.as_row().map(<[Value]>::len), Some(2));
    }
}
