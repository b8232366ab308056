//! SQL batch payload with the ALL_HEADERS prefix.
//!
//! Requests sent inside an explicit transaction must carry the transaction
//! descriptor the server handed out in its BeginTransaction environment
//! change; zero means auto-commit.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{decode_ucs2, write_ucs2};
use crate::error::ProtocolError;

/// ALL_HEADERS header type for the transaction descriptor.
const HEADER_TRANSACTION_DESCRIPTOR: u16 = 0x0002;

/// Size of ALL_HEADERS with only the transaction descriptor header.
const ALL_HEADERS_LEN: u32 = 22;

/// The ALL_HEADERS prefix of SQLBatch and RPC requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllHeaders {
    /// Active transaction descriptor, 0 for none.
    pub transaction_descriptor: u64,
    /// Requests outstanding on the session.
    pub outstanding_requests: u32,
}

impl Default for AllHeaders {
    fn default() -> Self {
        Self {
            transaction_descriptor: 0,
            outstanding_requests: 1,
        }
    }
}

impl AllHeaders {
    /// Headers for a request in the given transaction.
    #[must_use]
    pub fn with_transaction(transaction_descriptor: u64) -> Self {
        Self {
            transaction_descriptor,
            ..Self::default()
        }
    }

    /// Encode the prefix.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(ALL_HEADERS_LEN);
        dst.put_u32_le(ALL_HEADERS_LEN - 4);
        dst.put_u16_le(HEADER_TRANSACTION_DESCRIPTOR);
        dst.put_u64_le(self.transaction_descriptor);
        dst.put_u32_le(self.outstanding_requests);
    }

    /// Decode the prefix, skipping header types other than the transaction
    /// descriptor.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let total = src.get_u32_le() as usize;
        if total < 4 || src.remaining() < total - 4 {
            return Err(ProtocolError::InvalidField {
                field: "ALL_HEADERS length",
                value: total as u32,
            });
        }
        let mut headers = src.copy_to_bytes(total - 4);
        let mut result = Self::default();
        while headers.remaining() >= 6 {
            let len = headers.get_u32_le() as usize;
            let kind = headers.get_u16_le();
            let body_len = len.saturating_sub(6);
            if headers.remaining() < body_len {
                return Err(ProtocolError::UnexpectedEof);
            }
            let mut body = headers.copy_to_bytes(body_len);
            if kind == HEADER_TRANSACTION_DESCRIPTOR && body.remaining() >= 12 {
                result.transaction_descriptor = body.get_u64_le();
                result.outstanding_requests = body.get_u32_le();
            }
        }
        Ok(result)
    }
}

/// A SQL batch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlBatch {
    /// Statement text.
    pub sql: String,
    /// Request headers.
    pub headers: AllHeaders,
}

impl SqlBatch {
    /// Batch outside any explicit transaction.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            headers: AllHeaders::default(),
        }
    }

    /// Run the batch inside the given transaction.
    #[must_use]
    pub fn in_transaction(mut self, transaction_descriptor: u64) -> Self {
        self.headers.transaction_descriptor = transaction_descriptor;
        self
    }

    /// Encode the payload of a SQLBatch message.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ALL_HEADERS_LEN as usize + self.sql.len() * 2);
        self.headers.encode(&mut buf);
        write_ucs2(&mut buf, &self.sql);
        buf.freeze()
    }

    /// Decode a SQLBatch payload.
    pub fn decode(mut src: impl Buf) -> Result<Self, ProtocolError> {
        let headers = AllHeaders::decode(&mut src)?;
        let text = src.copy_to_bytes(src.remaining());
        Ok(Self {
            sql: decode_ucs2(&text)?,
            headers,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let payload = SqlBatch::new("SELECT 1").encode();
        assert_eq!(payload.len(), 22 + 16);
        assert_eq!(&payload[0..4], &[22, 0, 0, 0]);
        assert_eq!(&payload[4..8], &[18, 0, 0, 0]);
        assert_eq!(&payload[8..10], &[0x02, 0x00]);
        assert_eq!(&payload[18..22], &[1, 0, 0, 0]);
        assert_eq!(&payload[22..24], &[b'S', 0]);
    }

    #[test]
    fn test_transaction_descriptor_roundtrip() {
        let batch = SqlBatch::new("COMMIT").in_transaction(0x0102_0304_0506_0708);
        let decoded = SqlBatch::decode(batch.encode()).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_bad_total_length() {
        let payload: &[u8] = &[0xFF, 0, 0, 0, 1, 2];
        assert!(SqlBatch::decode(payload).is_err());
    }
}
