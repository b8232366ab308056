//! UCS-2 string and length-prefixed field helpers.
//!
//! TDS carries text as UTF-16LE. The two length-prefixed encodings used
//! throughout the token stream are:
//!
//! - B_VARCHAR: 1-byte character count, then the characters
//! - US_VARCHAR: 2-byte little-endian character count, then the characters
//!
//! Binary fields use the same prefixes counted in bytes (B_VARBYTE,
//! US_VARBYTE).

use bytes::{Buf, BufMut, Bytes};

use crate::error::ProtocolError;

fn ensure(src: &impl Buf, needed: usize) -> Result<(), ProtocolError> {
    if src.remaining() < needed {
        return Err(ProtocolError::IncompletePacket {
            expected: needed,
            actual: src.remaining(),
        });
    }
    Ok(())
}

/// Decode UTF-16LE bytes into a `String`.
pub fn decode_ucs2(bytes: &[u8]) -> Result<String, ProtocolError> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::StringEncoding(format!(
            "odd UTF-16 byte length {}",
            bytes.len()
        )));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| ProtocolError::StringEncoding(e.to_string()))
}

/// Encode a string as UTF-16LE bytes.
#[must_use]
pub fn encode_ucs2(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Byte length of a string once encoded as UTF-16.
#[must_use]
pub fn ucs2_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

/// Read `char_count` UTF-16 code units.
pub fn read_ucs2(src: &mut impl Buf, char_count: usize) -> Result<String, ProtocolError> {
    let byte_count = char_count * 2;
    ensure(src, byte_count)?;
    let mut raw = vec![0u8; byte_count];
    src.copy_to_slice(&mut raw);
    decode_ucs2(&raw)
}

/// Read a B_VARCHAR.
pub fn read_b_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    ensure(src, 1)?;
    let len = src.get_u8() as usize;
    read_ucs2(src, len)
}

/// Read a US_VARCHAR.
pub fn read_us_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    ensure(src, 2)?;
    let len = src.get_u16_le() as usize;
    read_ucs2(src, len)
}

/// Read a B_VARBYTE.
pub fn read_b_varbyte(src: &mut impl Buf) -> Result<Bytes, ProtocolError> {
    ensure(src, 1)?;
    let len = src.get_u8() as usize;
    ensure(src, len)?;
    Ok(src.copy_to_bytes(len))
}

/// Read a US_VARBYTE.
pub fn read_us_varbyte(src: &mut impl Buf) -> Result<Bytes, ProtocolError> {
    ensure(src, 2)?;
    let len = src.get_u16_le() as usize;
    ensure(src, len)?;
    Ok(src.copy_to_bytes(len))
}

/// Write a B_VARCHAR. Fails if the string exceeds 255 code units.
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) -> Result<(), ProtocolError> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = u8::try_from(units.len()).map_err(|_| ProtocolError::ValueTooLarge {
        field: "B_VARCHAR",
        len: units.len(),
        max: u8::MAX as usize,
    })?;
    dst.put_u8(len);
    for unit in units {
        dst.put_u16_le(unit);
    }
    Ok(())
}

/// Write a US_VARCHAR. Fails if the string exceeds 65535 code units.
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) -> Result<(), ProtocolError> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = u16::try_from(units.len()).map_err(|_| ProtocolError::ValueTooLarge {
        field: "US_VARCHAR",
        len: units.len(),
        max: u16::MAX as usize,
    })?;
    dst.put_u16_le(len);
    for unit in units {
        dst.put_u16_le(unit);
    }
    Ok(())
}

/// Write a B_VARBYTE.
pub fn write_b_varbyte(dst: &mut impl BufMut, data: &[u8]) -> Result<(), ProtocolError> {
    let len = u8::try_from(data.len()).map_err(|_| ProtocolError::ValueTooLarge {
        field: "B_VARBYTE",
        len: data.len(),
        max: u8::MAX as usize,
    })?;
    dst.put_u8(len);
    dst.put_slice(data);
    Ok(())
}

/// Write a string as UTF-16LE without a length prefix.
pub fn write_ucs2(dst: &mut impl BufMut, s: &str) {
    for unit in s.encode_utf16() {
        dst.put_u16_le(unit);
    }
}
