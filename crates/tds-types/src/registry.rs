//! Type registry: TYPE_INFO parsing and value encode/decode.
//!
//! The token decoder never interprets column data itself. It hands the
//! message stream to a [`TypeRegistry`], which reads exactly the bytes a value
//! occupies and leaves the stream positioned at the next field.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tds_framer::read_bytes;
use tds_protocol::token::Collation;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::descriptor::{LengthKind, TypeDescriptor, TypeId};
use crate::error::TypeError;
use crate::value::Value;

/// Reader handed to a registry: a message-scoped stream.
pub type ValueReader<'a> = dyn AsyncRead + Unpin + Send + 'a;

const USHORT_NULL: u16 = 0xFFFF;
const PLP_NULL: u64 = u64::MAX;
const PLP_UNKNOWN_LENGTH: u64 = u64::MAX - 1;

/// Pluggable type handling used by the token decoder.
#[async_trait]
pub trait TypeRegistry: Send + Sync {
    /// Read a TYPE_INFO record.
    async fn read_type_info(&self, reader: &mut ValueReader<'_>) -> Result<TypeDescriptor, TypeError>;

    /// Read one value of type `ty`.
    async fn decode_value(
        &self,
        ty: &TypeDescriptor,
        reader: &mut ValueReader<'_>,
    ) -> Result<Value, TypeError>;

    /// Append the TYPE_INFO record for `ty`.
    fn write_type_info(&self, ty: &TypeDescriptor, dst: &mut BytesMut) -> Result<(), TypeError>;

    /// Append `value` encoded as type `ty`, length prefix included.
    fn encode_value(
        &self,
        ty: &TypeDescriptor,
        value: &Value,
        dst: &mut BytesMut,
    ) -> Result<(), TypeError>;
}

/// Registry for the integer, float, bit, GUID, character and binary types.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardRegistry;

impl StandardRegistry {
    /// Create the registry.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn type_name(type_id: TypeId) -> &'static str {
    match type_id {
        TypeId::Null => "null",
        TypeId::TinyInt => "tinyint",
        TypeId::Bit | TypeId::BitN => "bit",
        TypeId::SmallInt => "smallint",
        TypeId::Int => "int",
        TypeId::BigInt => "bigint",
        TypeId::IntN => "intn",
        TypeId::Real => "real",
        TypeId::Float => "float",
        TypeId::FloatN => "floatn",
        TypeId::Guid => "uniqueidentifier",
        TypeId::BigVarBinary | TypeId::BigBinary => "binary",
        TypeId::BigVarChar | TypeId::BigChar => "varchar",
        TypeId::NVarChar | TypeId::NChar => "nvarchar",
    }
}

fn valid_byte_length(type_id: TypeId, len: u32) -> bool {
    match type_id {
        TypeId::IntN => matches!(len, 1 | 2 | 4 | 8),
        TypeId::BitN => len == 1,
        TypeId::FloatN => matches!(len, 4 | 8),
        TypeId::Guid => len == 16,
        _ => true,
    }
}

#[async_trait]
impl TypeRegistry for StandardRegistry {
    async fn read_type_info(&self, reader: &mut ValueReader<'_>) -> Result<TypeDescriptor, TypeError> {
        let raw = reader.read_u8().await?;
        let type_id = TypeId::from_u8(raw).ok_or(TypeError::UnsupportedType(raw))?;
        let mut ty = TypeDescriptor::fixed(type_id);

        if type_id.fixed_size().is_none() {
            ty.max_length = if type_id.has_ushort_length() {
                u32::from(reader.read_u16_le().await?)
            } else {
                u32::from(reader.read_u8().await?)
            };
            if !valid_byte_length(type_id, ty.max_length) {
                return Err(TypeError::InvalidLength {
                    type_name: type_name(type_id),
                    length: ty.max_length as usize,
                });
            }
        }
        if type_id.has_collation() {
            let info = reader.read_u32_le().await?;
            let sort_id = reader.read_u8().await?;
            ty.collation = Some(Collation { info, sort_id });
        }
        Ok(ty)
    }

    async fn decode_value(
        &self,
        ty: &TypeDescriptor,
        reader: &mut ValueReader<'_>,
    ) -> Result<Value, TypeError> {
        let raw = match ty.length_kind() {
            LengthKind::Fixed(size) => read_bytes(reader, size).await?,
            LengthKind::Byte => {
                let len = reader.read_u8().await? as usize;
                if len == 0 {
                    return Ok(Value::Null);
                }
                read_bytes(reader, len).await?
            }
            LengthKind::UShort => {
                let len = reader.read_u16_le().await?;
                if len == USHORT_NULL {
                    return Ok(Value::Null);
                }
                read_bytes(reader, len as usize).await?
            }
            LengthKind::Plp => match read_plp(reader).await? {
                Some(raw) => raw,
                None => return Ok(Value::Null),
            },
        };
        decode_payload(ty, raw)
    }

    fn write_type_info(&self, ty: &TypeDescriptor, dst: &mut BytesMut) -> Result<(), TypeError> {
        dst.put_u8(ty.type_id as u8);
        if ty.type_id.fixed_size().is_none() {
            if ty.type_id.has_ushort_length() {
                dst.put_u16_le(u16::try_from(ty.max_length).map_err(|_| TypeError::InvalidLength {
                    type_name: type_name(ty.type_id),
                    length: ty.max_length as usize,
                })?);
            } else {
                dst.put_u8(u8::try_from(ty.max_length).map_err(|_| TypeError::InvalidLength {
                    type_name: type_name(ty.type_id),
                    length: ty.max_length as usize,
                })?);
            }
        }
        if ty.type_id.has_collation() {
            ty.collation.unwrap_or_default().encode(dst);
        }
        Ok(())
    }

    fn encode_value(
        &self,
        ty: &TypeDescriptor,
        value: &Value,
        dst: &mut BytesMut,
    ) -> Result<(), TypeError> {
        let kind = ty.length_kind();
        if value.is_null() {
            match kind {
                LengthKind::Fixed(_) if ty.type_id != TypeId::Null => {
                    return Err(TypeError::TypeMismatch {
                        expected: type_name(ty.type_id),
                        actual: value.kind(),
                    });
                }
                LengthKind::Fixed(_) => {}
                LengthKind::Byte => dst.put_u8(0),
                LengthKind::UShort => dst.put_u16_le(USHORT_NULL),
                LengthKind::Plp => dst.put_u64_le(PLP_NULL),
            }
            return Ok(());
        }

        let payload = encode_payload(ty, value)?;
        match kind {
            LengthKind::Fixed(size) => {
                if payload.len() != size {
                    return Err(TypeError::InvalidLength {
                        type_name: type_name(ty.type_id),
                        length: payload.len(),
                    });
                }
            }
            LengthKind::Byte => dst.put_u8(payload.len() as u8),
            LengthKind::UShort => {
                if payload.len() > ty.max_length as usize {
                    return Err(TypeError::Truncation {
                        length: payload.len(),
                        max: ty.max_length as usize,
                    });
                }
                dst.put_u16_le(payload.len() as u16);
            }
            LengthKind::Plp => {
                dst.put_u64_le(payload.len() as u64);
                if !payload.is_empty() {
                    let chunk = u32::try_from(payload.len()).map_err(|_| TypeError::Truncation {
                        length: payload.len(),
                        max: u32::MAX as usize,
                    })?;
                    dst.put_u32_le(chunk);
                }
                dst.put_slice(&payload);
                dst.put_u32_le(0);
                return Ok(());
            }
        }
        dst.put_slice(&payload);
        Ok(())
    }
}

async fn read_plp(reader: &mut ValueReader<'_>) -> Result<Option<Bytes>, TypeError> {
    let total = reader.read_u64_le().await?;
    if total == PLP_NULL {
        return Ok(None);
    }
    let mut out = Vec::new();
    loop {
        let chunk = reader.read_u32_le().await?;
        if chunk == 0 {
            break;
        }
        let mut limited = (&mut *reader).take(u64::from(chunk));
        let read = limited.read_to_end(&mut out).await?;
        if read < chunk as usize {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
    }
    if total != PLP_UNKNOWN_LENGTH && total != out.len() as u64 {
        return Err(TypeError::InvalidLength {
            type_name: "plp",
            length: out.len(),
        });
    }
    Ok(Some(Bytes::from(out)))
}

fn decode_payload(ty: &TypeDescriptor, mut raw: Bytes) -> Result<Value, TypeError> {
    let invalid = |raw: &Bytes| TypeError::InvalidLength {
        type_name: type_name(ty.type_id),
        length: raw.len(),
    };

    let value = match (ty.type_id, raw.len()) {
        (TypeId::Null, _) => Value::Null,
        (TypeId::Bit | TypeId::BitN, 1) => Value::Bool(raw.get_u8() != 0),
        (TypeId::TinyInt | TypeId::IntN, 1) => Value::TinyInt(raw.get_u8()),
        (TypeId::SmallInt | TypeId::IntN, 2) => Value::SmallInt(raw.get_i16_le()),
        (TypeId::Int | TypeId::IntN, 4) => Value::Int(raw.get_i32_le()),
        (TypeId::BigInt | TypeId::IntN, 8) => Value::BigInt(raw.get_i64_le()),
        (TypeId::Real | TypeId::FloatN, 4) => Value::Real(raw.get_f32_le()),
        (TypeId::Float | TypeId::FloatN, 8) => Value::Float(raw.get_f64_le()),
        (TypeId::Guid, 16) => Value::Uuid(guid_from_wire(&raw)),
        (TypeId::NVarChar | TypeId::NChar, len) if len % 2 == 0 => Value::String(
            tds_protocol::codec::decode_ucs2(&raw)
                .map_err(|e| TypeError::InvalidEncoding(e.to_string()))?,
        ),
        (TypeId::BigVarChar | TypeId::BigChar, _) => {
            let (text, had_errors) = ty.encoding().decode_without_bom_handling(&raw);
            if had_errors {
                return Err(TypeError::InvalidEncoding(format!(
                    "invalid {} data",
                    ty.encoding().name()
                )));
            }
            Value::String(text.into_owned())
        }
        (TypeId::BigVarBinary | TypeId::BigBinary, _) => Value::Binary(raw),
        _ => return Err(invalid(&raw)),
    };
    Ok(value)
}

fn encode_payload(ty: &TypeDescriptor, value: &Value) -> Result<Vec<u8>, TypeError> {
    let mismatch = || TypeError::TypeMismatch {
        expected: type_name(ty.type_id),
        actual: value.kind(),
    };
    let out_of_range = || TypeError::OutOfRange {
        target: type_name(ty.type_id),
    };

    let int_width = match ty.type_id {
        TypeId::TinyInt => Some(1),
        TypeId::SmallInt => Some(2),
        TypeId::Int => Some(4),
        TypeId::BigInt => Some(8),
        TypeId::IntN => Some(ty.max_length),
        _ => None,
    };
    if let Some(width) = int_width {
        let v = value.as_i64().ok_or_else(mismatch)?;
        return match width {
            1 => Ok(vec![u8::try_from(v).map_err(|_| out_of_range())?]),
            2 => Ok(i16::try_from(v)
                .map_err(|_| out_of_range())?
                .to_le_bytes()
                .to_vec()),
            4 => Ok(i32::try_from(v)
                .map_err(|_| out_of_range())?
                .to_le_bytes()
                .to_vec()),
            _ => Ok(v.to_le_bytes().to_vec()),
        };
    }

    match ty.type_id {
        TypeId::Bit | TypeId::BitN => Ok(vec![u8::from(value.as_bool().ok_or_else(mismatch)?)]),
        TypeId::Real => Ok(real_bytes(value).ok_or_else(mismatch)?),
        TypeId::Float => Ok(float_bytes(value).ok_or_else(mismatch)?),
        TypeId::FloatN if ty.max_length == 4 => Ok(real_bytes(value).ok_or_else(mismatch)?),
        TypeId::FloatN => Ok(float_bytes(value).ok_or_else(mismatch)?),
        TypeId::Guid => match value {
            Value::Uuid(uuid) => Ok(guid_to_wire(uuid).to_vec()),
            _ => Err(mismatch()),
        },
        TypeId::NVarChar | TypeId::NChar => {
            let s = value.as_str().ok_or_else(mismatch)?;
            Ok(tds_protocol::codec::encode_ucs2(s))
        }
        TypeId::BigVarChar | TypeId::BigChar => {
            let s = value.as_str().ok_or_else(mismatch)?;
            let (bytes, _, had_errors) = ty.encoding().encode(s);
            if had_errors {
                return Err(TypeError::InvalidEncoding(format!(
                    "text not representable in {}",
                    ty.encoding().name()
                )));
            }
            Ok(bytes.into_owned())
        }
        TypeId::BigVarBinary | TypeId::BigBinary => {
            Ok(value.as_bytes().ok_or_else(mismatch)?.to_vec())
        }
        _ => Err(mismatch()),
    }
}

fn real_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Real(v) => Some(v.to_le_bytes().to_vec()),
        Value::Float(v) => Some((*v as f32).to_le_bytes().to_vec()),
        _ => None,
    }
}

fn float_bytes(value: &Value) -> Option<Vec<u8>> {
    value.as_f64().map(|v| v.to_le_bytes().to_vec())
}

/// SQL Server stores the first three GUID groups little-endian.
fn guid_from_wire(raw: &[u8]) -> uuid::Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&raw[..16]);
    bytes[0..4].reverse();
    bytes[4..6].reverse();
    bytes[6..8].reverse();
    uuid::Uuid::from_bytes(bytes)
}

fn guid_to_wire(uuid: &uuid::Uuid) -> [u8; 16] {
    let mut bytes = *uuid.as_bytes();
    bytes[0..4].reverse();
    bytes[4..6].reverse();
    bytes[6..8].reverse();
    bytes
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::descriptor::MAX_LENGTH_PLP;

    async fn decode(ty: &TypeDescriptor, mut wire: &[u8]) -> Result<Value, TypeError> {
        StandardRegistry.decode_value(ty, &mut wire).await
    }

    fn encode(ty: &TypeDescriptor, value: &Value) -> BytesMut {
        let mut dst = BytesMut::new();
        StandardRegistry.encode_value(ty, value, &mut dst).unwrap();
        dst
    }

    #[tokio::test]
    async fn test_read_type_info_nvarchar() {
        let mut wire: &[u8] = &[0xE7, 0x40, 0x00, 0x09, 0x04, 0xD0, 0x00, 0x34];
        let ty = StandardRegistry.read_type_info(&mut wire).await.unwrap();
        assert_eq!(ty.type_id, TypeId::NVarChar);
        assert_eq!(ty.max_length, 64);
        assert_eq!(ty.collation.unwrap().lcid(), 0x0409);
        assert_eq!(ty.collation.unwrap().sort_id, 0x34);
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_read_type_info_rejects_bad_intn_width() {
        let mut wire: &[u8] = &[0x26, 0x03];
        let err = StandardRegistry.read_type_info(&mut wire).await.unwrap_err();
        assert!(matches!(err, TypeError::InvalidLength { length: 3, .. }));
    }

    #[tokio::test]
    async fn test_unsupported_type() {
        let mut wire: &[u8] = &[0x6C];
        let err = StandardRegistry.read_type_info(&mut wire).await.unwrap_err();
        assert!(matches!(err, TypeError::UnsupportedType(0x6C)));
    }

    #[tokio::test]
    async fn test_decode_fixed_and_nullable_ints() {
        let int = TypeDescriptor::fixed(TypeId::Int);
        assert_eq!(
            decode(&int, &(-5i32).to_le_bytes()).await.unwrap(),
            Value::Int(-5)
        );

        let intn = TypeDescriptor::intn(8);
        assert_eq!(decode(&intn, &[0]).await.unwrap(), Value::Null);
        let mut wire = vec![8];
        wire.extend(42i64.to_le_bytes());
        assert_eq!(decode(&intn, &wire).await.unwrap(), Value::BigInt(42));
    }

    #[tokio::test]
    async fn test_decode_nvarchar_null_and_text() {
        let ty = TypeDescriptor::nvarchar(10);
        assert_eq!(decode(&ty, &[0xFF, 0xFF]).await.unwrap(), Value::Null);
        assert_eq!(
            decode(&ty, &[4, 0, b'h', 0, b'i', 0]).await.unwrap(),
            Value::String("hi".into())
        );
    }

    #[tokio::test]
    async fn test_decode_varchar_uses_collation_code_page() {
        let ty = TypeDescriptor::varchar(
            10,
            Collation {
                info: 0x0419,
                sort_id: 0,
            },
        );
        // "Да" in windows-1251
        assert_eq!(
            decode(&ty, &[2, 0, 0xC4, 0xE0]).await.unwrap(),
            Value::String("Да".into())
        );
    }

    #[tokio::test]
    async fn test_guid_mixed_endian() {
        let uuid = uuid::Uuid::parse_str("01020304-0506-0708-090a-0b0c0d0e0f10").unwrap();
        let wire = encode(&TypeDescriptor::guid(), &Value::Uuid(uuid));
        assert_eq!(
            &wire[..],
            &[16, 4, 3, 2, 1, 6, 5, 8, 7, 9, 10, 11, 12, 13, 14, 15, 16]
        );
        assert_eq!(
            decode(&TypeDescriptor::guid(), &wire).await.unwrap(),
            Value::Uuid(uuid)
        );
    }

    #[tokio::test]
    async fn test_plp_chunks_reassembled() {
        let ty = TypeDescriptor::nvarchar(MAX_LENGTH_PLP);
        let mut wire = Vec::new();
        wire.extend(8u64.to_le_bytes());
        wire.extend(4u32.to_le_bytes());
        wire.extend([b'a', 0, b'b', 0]);
        wire.extend(4u32.to_le_bytes());
        wire.extend([b'c', 0, b'd', 0]);
        wire.extend(0u32.to_le_bytes());
        assert_eq!(
            decode(&ty, &wire).await.unwrap(),
            Value::String("abcd".into())
        );

        assert_eq!(
            decode(&ty, &u64::MAX.to_le_bytes()).await.unwrap(),
            Value::Null
        );
    }

    #[tokio::test]
    async fn test_plp_length_mismatch() {
        let ty = TypeDescriptor::varbinary(MAX_LENGTH_PLP);
        let mut wire = Vec::new();
        wire.extend(10u64.to_le_bytes());
        wire.extend(2u32.to_le_bytes());
        wire.extend([1, 2]);
        wire.extend(0u32.to_le_bytes());
        assert!(matches!(
            decode(&ty, &wire).await,
            Err(TypeError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_encode_range_and_mismatch() {
        let mut dst = BytesMut::new();
        assert!(matches!(
            StandardRegistry.encode_value(
                &TypeDescriptor::intn(2),
                &Value::BigInt(70_000),
                &mut dst
            ),
            Err(TypeError::OutOfRange { .. })
        ));
        assert!(matches!(
            StandardRegistry.encode_value(
                &TypeDescriptor::fixed(TypeId::Int),
                &Value::String("1".into()),
                &mut dst
            ),
            Err(TypeError::TypeMismatch { .. })
        ));
        assert!(matches!(
            StandardRegistry.encode_value(
                &TypeDescriptor::nvarchar(1),
                &Value::String("too long".into()),
                &mut dst
            ),
            Err(TypeError::Truncation { .. })
        ));
    }

    #[test]
    fn test_write_type_info_layout() {
        let mut dst = BytesMut::new();
        StandardRegistry
            .write_type_info(&TypeDescriptor::intn(4), &mut dst)
            .unwrap();
        StandardRegistry
            .write_type_info(&TypeDescriptor::nvarchar(20), &mut dst)
            .unwrap();
        assert_eq!(&dst[..2], &[0x26, 4]);
        assert_eq!(&dst[2..5], &[0xE7, 40, 0]);
        assert_eq!(dst.len(), 10);
    }
}
