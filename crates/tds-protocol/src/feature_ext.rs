//! LOGIN7 feature extensions and the federated authentication messages.
//!
//! The feature extension block sits at the end of LOGIN7: a sequence of
//! `(id u8, length u32 LE, data)` entries closed by `0xFF`. The only feature
//! the login sequence produces is FEDAUTH; others can be carried raw.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::encode_ucs2;
use crate::error::ProtocolError;

/// Closes the feature extension block.
pub const FEATURE_TERMINATOR: u8 = 0xFF;

/// Feature ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FeatureId {
    /// Session recovery.
    SessionRecovery = 0x01,
    /// Federated authentication.
    FedAuth = 0x02,
    /// Always Encrypted.
    ColumnEncryption = 0x04,
    /// Global transactions.
    GlobalTransactions = 0x05,
    /// Azure SQL support.
    AzureSqlSupport = 0x08,
    /// Data classification.
    DataClassification = 0x09,
    /// UTF-8 collations.
    Utf8Support = 0x0A,
}

/// Federated authentication library selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FedAuthLibrary {
    /// Client already holds a token.
    SecurityToken = 0x01,
    /// Server supplies SPN and STS URL, client fetches the token.
    Adal = 0x02,
}

/// Workflow byte sent with the ADAL library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AdalWorkflow {
    /// User name and password.
    #[default]
    Password = 0x01,
    /// Integrated Windows authentication.
    Integrated = 0x02,
    /// Managed service identity.
    ManagedIdentity = 0x03,
}

/// The FEDAUTH feature extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FedAuthFeature {
    /// Library in use.
    pub library: FedAuthLibrary,
    /// Echo of the server's Pre-Login FEDAUTHREQUIRED value.
    pub echo: bool,
    /// Token for the security-token library.
    pub token: String,
    /// Nonce from the server's Pre-Login, echoed with the token.
    pub nonce: Option<[u8; 32]>,
    /// Workflow for the ADAL library.
    pub workflow: AdalWorkflow,
}

impl FedAuthFeature {
    /// Feature for a token the client already holds.
    #[must_use]
    pub fn security_token(token: impl Into<String>) -> Self {
        Self {
            library: FedAuthLibrary::SecurityToken,
            echo: false,
            token: token.into(),
            nonce: None,
            workflow: AdalWorkflow::default(),
        }
    }

    /// Feature asking the server for FedAuthInfo.
    #[must_use]
    pub fn adal(workflow: AdalWorkflow) -> Self {
        Self {
            library: FedAuthLibrary::Adal,
            echo: false,
            token: String::new(),
            nonce: None,
            workflow,
        }
    }

    /// Set the echo bit.
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Feature payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let options = ((self.library as u8) << 1) | u8::from(self.echo);
        let mut buf = BytesMut::new();
        buf.put_u8(options);
        match self.library {
            FedAuthLibrary::SecurityToken => {
                let token = encode_ucs2(&self.token);
                buf.put_u32_le(token.len() as u32);
                buf.put_slice(&token);
                if let Some(nonce) = &self.nonce {
                    buf.put_slice(nonce);
                }
            }
            FedAuthLibrary::Adal => buf.put_u8(self.workflow as u8),
        }
        buf.freeze()
    }
}

/// An ordered set of feature extensions with unique ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureExtensions {
    entries: Vec<(u8, Bytes)>,
}

impl FeatureExtensions {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw feature. Rejects a second feature with the same id.
    pub fn add(&mut self, id: u8, data: Bytes) -> Result<(), ProtocolError> {
        if self.entries.iter().any(|(existing, _)| *existing == id) {
            return Err(ProtocolError::DuplicateFeature(id));
        }
        self.entries.push((id, data));
        Ok(())
    }

    /// Add the FEDAUTH feature.
    pub fn add_fed_auth(&mut self, feature: &FedAuthFeature) -> Result<(), ProtocolError> {
        self.add(FeatureId::FedAuth as u8, feature.encode())
    }

    /// Whether no feature was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Data of the feature with the given id.
    #[must_use]
    pub fn get(&self, id: u8) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(existing, _)| *existing == id)
            .map(|(_, data)| data)
    }

    /// Encode the block, terminator included. Empty when no feature was added.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        if self.entries.is_empty() {
            return Bytes::new();
        }
        let mut buf = BytesMut::new();
        for (id, data) in &self.entries {
            buf.put_u8(*id);
            buf.put_u32_le(data.len() as u32);
            buf.put_slice(data);
        }
        buf.put_u8(FEATURE_TERMINATOR);
        buf.freeze()
    }

    /// Decode a block up to and including its terminator.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut features = Self::new();
        loop {
            if !src.has_remaining() {
                return Err(ProtocolError::UnexpectedEof);
            }
            let id = src.get_u8();
            if id == FEATURE_TERMINATOR {
                return Ok(features);
            }
            if src.remaining() < 4 {
                return Err(ProtocolError::UnexpectedEof);
            }
            let len = src.get_u32_le() as usize;
            if src.remaining() < len {
                return Err(ProtocolError::IncompletePacket {
                    expected: len,
                    actual: src.remaining(),
                });
            }
            features.add(id, src.copy_to_bytes(len))?;
        }
    }
}

/// Payload of a FEDAUTH_TOKEN (0x08) message.
#[must_use]
pub fn encode_fed_auth_token(token: &str, nonce: Option<&[u8; 32]>) -> Bytes {
    let token = encode_ucs2(token);
    let nonce_len = nonce.map_or(0, |n| n.len());
    let mut buf = BytesMut::with_capacity(8 + token.len() + nonce_len);
    buf.put_u32_le((4 + token.len() + nonce_len) as u32);
    buf.put_u32_le(token.len() as u32);
    buf.put_slice(&token);
    if let Some(nonce) = nonce {
        buf.put_slice(nonce);
    }
    buf.freeze()
}

/// Token carried by a FEDAUTH_TOKEN message, for server-side decoding.
pub fn decode_fed_auth_token(mut src: impl Buf) -> Result<String, ProtocolError> {
    if src.remaining() < 8 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let _data_len = src.get_u32_le();
    let token_len = src.get_u32_le() as usize;
    if src.remaining() < token_len {
        return Err(ProtocolError::IncompletePacket {
            expected: token_len,
            actual: src.remaining(),
        });
    }
    let raw = src.copy_to_bytes(token_len);
    crate::codec::decode_ucs2(&raw)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_security_token_feature() {
        let data = FedAuthFeature::security_token("ab").with_echo(true).encode();
        assert_eq!(data[0], 0x03);
        assert_eq!(&data[1..5], &4u32.to_le_bytes());
        assert_eq!(&data[5..], &[b'a', 0, b'b', 0]);
    }

    #[test]
    fn test_adal_feature() {
        let data = FedAuthFeature::adal(AdalWorkflow::Password).encode();
        assert_eq!(&data[..], &[0x04, 0x01]);
    }

    #[test]
    fn test_duplicate_feature_rejected() {
        let mut features = FeatureExtensions::new();
        features
            .add_fed_auth(&FedAuthFeature::adal(AdalWorkflow::Integrated))
            .unwrap();
        assert_eq!(
            features.add(FeatureId::FedAuth as u8, Bytes::new()),
            Err(ProtocolError::DuplicateFeature(0x02))
        );
    }

    #[test]
    fn test_block_roundtrip() {
        let mut features = FeatureExtensions::new();
        features.add(0x0A, Bytes::from_static(&[1])).unwrap();
        features
            .add_fed_auth(&FedAuthFeature::security_token("t"))
            .unwrap();

        let block = features.encode();
        assert_eq!(*block.last().unwrap(), FEATURE_TERMINATOR);

        let mut cursor = block.clone();
        let decoded = FeatureExtensions::decode(&mut cursor).unwrap();
        assert_eq!(decoded, features);
        assert!(!cursor.has_remaining());
    }

    #[test]
    fn test_empty_block_encodes_nothing() {
        assert!(FeatureExtensions::new().encode().is_empty());
    }

    #[test]
    fn test_fed_auth_token_message() {
        let nonce = [9u8; 32];
        let payload = encode_fed_auth_token("tok", Some(&nonce));
        assert_eq!(&payload[..4], &(4u32 + 6 + 32).to_le_bytes());
        assert_eq!(&payload[4..8], &6u32.to_le_bytes());
        assert_eq!(decode_fed_auth_token(payload).unwrap(), "tok");
    }
}
