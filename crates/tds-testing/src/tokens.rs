//! Builder for server token streams.
//!
//! Tests describe a reply token by token and get back the bytes a server
//! would put in a TabularResult message. Encoding failures are held until
//! [`TokenStreamBuilder::build`], so calls chain without `?` at each step.

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::codec::write_b_varchar;
use tds_protocol::token::{
    Done, DoneStatus, EnvChange, FeatureExtAck, FedAuthInfo, LoginAck, ServerMessage, TokenType,
    encode_return_status, encode_sspi,
};
use tds_types::{StandardRegistry, TypeDescriptor, TypeRegistry, Value};

use crate::mock_server::{MockServerError, Result};

const COLUMN_NULLABLE: u16 = 0x0001;
const OUTPUT_PARAMETER: u8 = 0x01;

/// Accumulates encoded tokens.
///
/// # Example
///
/// ```rust,ignore
/// use tds_testing::TokenStreamBuilder;
/// use tds_protocol::token::DoneStatus;
///
/// let reply = TokenStreamBuilder::new()
///     .error(208, 16, "Invalid object name 'missing'.")
///     .done(DoneStatus::ERROR, 0)
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct TokenStreamBuilder {
    buf: BytesMut,
    registry: StandardRegistry,
    failed: Option<String>,
}

impl TokenStreamBuilder {
    /// Empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    fn push<F>(mut self, encode: F) -> Self
    where
        F: FnOnce(&mut BytesMut, &StandardRegistry) -> std::result::Result<(), String>,
    {
        if self.failed.is_none() {
            if let Err(err) = encode(&mut self.buf, &self.registry) {
                self.failed = Some(err);
            }
        }
        self
    }

    /// COLMETADATA for nullable columns.
    pub fn col_metadata<S: AsRef<str>>(self, columns: &[(S, TypeDescriptor)]) -> Self {
        self.push(|dst, registry| {
            let count = u16::try_from(columns.len()).map_err(|e| e.to_string())?;
            dst.put_u8(TokenType::ColMetaData as u8);
            dst.put_u16_le(count);
            for (name, ty) in columns {
                dst.put_u32_le(0);
                dst.put_u16_le(COLUMN_NULLABLE);
                registry.write_type_info(ty, dst).map_err(|e| e.to_string())?;
                write_b_varchar(dst, name.as_ref()).map_err(|e| e.to_string())?;
            }
            Ok(())
        })
    }

    /// ROW with every value written out.
    pub fn row(self, types: &[TypeDescriptor], values: &[Value]) -> Self {
        self.push(|dst, registry| {
            check_arity(types, values)?;
            dst.put_u8(TokenType::Row as u8);
            for (ty, value) in types.iter().zip(values) {
                registry
                    .encode_value(ty, value, dst)
                    .map_err(|e| e.to_string())?;
            }
            Ok(())
        })
    }

    /// NBCROW: nulls go in the bitmap and are left out of the data.
    pub fn nbc_row(self, types: &[TypeDescriptor], values: &[Value]) -> Self {
        self.push(|dst, registry| {
            check_arity(types, values)?;
            dst.put_u8(TokenType::NbcRow as u8);
            let mut bitmap = vec![0u8; values.len().div_ceil(8)];
            for (i, value) in values.iter().enumerate() {
                if value.is_null() {
                    bitmap[i / 8] |= 1 << (i % 8);
                }
            }
            dst.put_slice(&bitmap);
            for (ty, value) in types.iter().zip(values) {
                if !value.is_null() {
                    registry
                        .encode_value(ty, value, dst)
                        .map_err(|e| e.to_string())?;
                }
            }
            Ok(())
        })
    }

    /// DONE.
    pub fn done(self, status: DoneStatus, rows: u64) -> Self {
        self.done_token(TokenType::Done, status, rows)
    }

    /// DONEPROC.
    pub fn done_proc(self, status: DoneStatus, rows: u64) -> Self {
        self.done_token(TokenType::DoneProc, status, rows)
    }

    /// DONEINPROC.
    pub fn done_in_proc(self, status: DoneStatus, rows: u64) -> Self {
        self.done_token(TokenType::DoneInProc, status, rows)
    }

    fn done_token(self, token: TokenType, status: DoneStatus, rows: u64) -> Self {
        self.push(|dst, _| {
            let done = Done {
                status,
                cur_cmd: 0,
                row_count: rows,
            };
            done.encode(token, dst);
            Ok(())
        })
    }

    /// ERROR with state 1.
    pub fn error(self, number: i32, class: u8, message: &str) -> Self {
        self.message(TokenType::Error, number, class, message)
    }

    /// INFO with class 0.
    pub fn info(self, number: i32, message: &str) -> Self {
        self.message(TokenType::Info, number, 0, message)
    }

    fn message(self, token: TokenType, number: i32, class: u8, message: &str) -> Self {
        self.push(|dst, _| {
            let msg = ServerMessage {
                number,
                state: 1,
                class,
                message: message.to_owned(),
                server: "mock".into(),
                ..ServerMessage::default()
            };
            msg.encode(token, dst).map_err(|e| e.to_string())
        })
    }

    /// ENVCHANGE.
    pub fn env_change(self, change: &EnvChange) -> Self {
        self.push(|dst, _| change.encode(dst).map_err(|e| e.to_string()))
    }

    /// LOGINACK.
    pub fn login_ack(self, ack: &LoginAck) -> Self {
        self.push(|dst, _| ack.encode(dst).map_err(|e| e.to_string()))
    }

    /// RETURNSTATUS.
    pub fn return_status(self, status: i32) -> Self {
        self.push(|dst, _| {
            encode_return_status(status, dst);
            Ok(())
        })
    }

    /// RETURNVALUE for an output parameter.
    pub fn return_value(self, ordinal: u16, name: &str, ty: &TypeDescriptor, value: &Value) -> Self {
        self.push(|dst, registry| {
            dst.put_u8(TokenType::ReturnValue as u8);
            dst.put_u16_le(ordinal);
            write_b_varchar(dst, name).map_err(|e| e.to_string())?;
            dst.put_u8(OUTPUT_PARAMETER);
            dst.put_u32_le(0);
            dst.put_u16_le(COLUMN_NULLABLE);
            registry.write_type_info(ty, dst).map_err(|e| e.to_string())?;
            registry
                .encode_value(ty, value, dst)
                .map_err(|e| e.to_string())
        })
    }

    /// ORDER.
    pub fn order(self, columns: &[u16]) -> Self {
        self.push(|dst, _| {
            let len = u16::try_from(columns.len() * 2).map_err(|e| e.to_string())?;
            dst.put_u8(TokenType::Order as u8);
            dst.put_u16_le(len);
            for column in columns {
                dst.put_u16_le(*column);
            }
            Ok(())
        })
    }

    /// SSPI challenge.
    pub fn sspi(self, data: &[u8]) -> Self {
        self.push(|dst, _| encode_sspi(data, dst).map_err(|e| e.to_string()))
    }

    /// FEDAUTHINFO.
    pub fn fed_auth_info(self, info: &FedAuthInfo) -> Self {
        self.push(|dst, _| {
            info.encode(dst);
            Ok(())
        })
    }

    /// FEATUREEXTACK.
    pub fn feature_ext_ack(self, ack: &FeatureExtAck) -> Self {
        self.push(|dst, _| {
            ack.encode(dst);
            Ok(())
        })
    }

    /// Bytes appended as given.
    pub fn raw(self, bytes: &[u8]) -> Self {
        self.push(|dst, _| {
            dst.put_slice(bytes);
            Ok(())
        })
    }

    /// Encoded stream, or the first encoding failure.
    pub fn build(self) -> Result<Bytes> {
        match self.failed {
            Some(err) => Err(MockServerError::Protocol(err)),
            None => Ok(self.buf.freeze()),
        }
    }
}

fn check_arity(types: &[TypeDescriptor], values: &[Value]) -> std::result::Result<(), String> {
    if types.len() != values.len() {
        return Err(format!(
            "{} values for {} columns",
            values.len(),
            types.len()
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_nbc_row_bitmap_and_skipped_values() {
        let types = [TypeDescriptor::intn(4); 3];
        let tokens = TokenStreamBuilder::new()
            .nbc_row(&types, &[Value::Null, Value::Int(7), Value::Null])
            .build()
            .unwrap();
        assert_eq!(&tokens[..], &[0xD2, 0b0000_0101, 0x04, 7, 0, 0, 0]);
    }

    #[test]
    fn test_done_layout() {
        let tokens = TokenStreamBuilder::new()
            .done(DoneStatus::COUNT, 3)
            .build()
            .unwrap();
        assert_eq!(tokens.len(), 1 + Done::SIZE);
        assert_eq!(tokens[0], TokenType::Done as u8);
        assert_eq!(&tokens[5..7], &[3, 0]);
    }

    #[test]
    fn test_arity_mismatch_is_reported_at_build() {
        let result = TokenStreamBuilder::new()
            .row(&[TypeDescriptor::intn(4)], &[])
            .done(DoneStatus::empty(), 0)
            .build();
        assert!(matches!(result, Err(MockServerError::Protocol(_))));
    }

    #[test]
    fn test_order_layout() {
        let tokens = TokenStreamBuilder::new().order(&[2, 1]).build().unwrap();
        assert_eq!(&tokens[..], &[0xA9, 4, 0, 2, 0, 1, 0]);
    }
}
