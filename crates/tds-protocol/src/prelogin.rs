//! Pre-Login record.
//!
//! The first message on every connection. Both directions use the same
//! layout: a list of `(tag, offset, length)` option headers (offset and
//! length big-endian, offset measured from the start of the record), a
//! `0xFF` terminator, then the option values in header order.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::version::SqlServerVersion;

/// Size of one option header.
const OPTION_HEADER_SIZE: usize = 5;

/// Pre-Login option tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Version of the sender.
    Version = 0x00,
    /// Encryption capability.
    Encryption = 0x01,
    /// Instance name, for dynamic port resolution.
    Instance = 0x02,
    /// Client thread id.
    ThreadId = 0x03,
    /// Multiple active result sets.
    Mars = 0x04,
    /// Activity and connection trace id.
    TraceId = 0x05,
    /// Federated authentication required.
    FedAuthRequired = 0x06,
    /// Nonce for federated authentication.
    Nonce = 0x07,
    /// End of the option list.
    Terminator = 0xFF,
}

/// Encryption capability exchanged in Pre-Login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt the login only.
    #[default]
    Off = 0x00,
    /// Encrypt the whole session.
    On = 0x01,
    /// No TLS available.
    NotSupported = 0x02,
    /// Server insists on encrypting the whole session.
    Required = 0x03,
}

impl EncryptionLevel {
    /// Parse an encryption byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Off),
            0x01 => Ok(Self::On),
            0x02 => Ok(Self::NotSupported),
            0x03 => Ok(Self::Required),
            _ => Err(ProtocolError::InvalidField {
                field: "encryption",
                value: u32::from(value),
            }),
        }
    }

    /// Whether this level asks for the whole session to be encrypted.
    #[must_use]
    pub const fn is_full_encryption(&self) -> bool {
        matches!(self, Self::On | Self::Required)
    }
}

/// Trace identifiers carried in the TRACEID option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceId {
    /// Connection id.
    pub connection_id: [u8; 16],
    /// Activity id.
    pub activity_id: [u8; 16],
    /// Activity sequence number.
    pub activity_sequence: u32,
}

/// A decoded or to-be-encoded Pre-Login record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreLogin {
    /// Sender version. Servers put their product version here.
    pub version: SqlServerVersion,
    /// Encryption capability.
    pub encryption: EncryptionLevel,
    /// Instance name.
    pub instance: Option<String>,
    /// Client thread id.
    pub thread_id: Option<u32>,
    /// MARS flag.
    pub mars: bool,
    /// Trace ids.
    pub trace_id: Option<TraceId>,
    /// FEDAUTHREQUIRED value. `None` when the option is absent, which for a
    /// server reply means federated authentication is unsupported.
    pub fed_auth_required: Option<bool>,
    /// 32-byte nonce.
    pub nonce: Option<[u8; 32]>,
}

impl PreLogin {
    /// Create an empty record with encryption `Off`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the version option.
    #[must_use]
    pub fn with_version(mut self, version: SqlServerVersion) -> Self {
        self.version = version;
        self
    }

    /// Set the encryption capability.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Set the instance name.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the thread id.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: u32) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    /// Set the MARS flag.
    #[must_use]
    pub fn with_mars(mut self, enabled: bool) -> Self {
        self.mars = enabled;
        self
    }

    /// Ask for (or, on the server side, require) federated authentication.
    #[must_use]
    pub fn with_fed_auth_required(mut self, required: bool) -> Self {
        self.fed_auth_required = Some(required);
        self
    }

    /// Set the nonce.
    #[must_use]
    pub fn with_nonce(mut self, nonce: [u8; 32]) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Set trace ids.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    fn options(&self) -> Vec<(PreLoginOption, Vec<u8>)> {
        let mut options = Vec::with_capacity(8);

        let mut version = Vec::with_capacity(6);
        version.extend_from_slice(&self.version.to_raw().to_be_bytes());
        version.extend_from_slice(&self.version.sub_build.to_le_bytes());
        options.push((PreLoginOption::Version, version));
        options.push((PreLoginOption::Encryption, vec![self.encryption as u8]));

        // Always sent by clients; an empty name is a lone terminator.
        let mut instance = self.instance.clone().unwrap_or_default().into_bytes();
        instance.push(0);
        options.push((PreLoginOption::Instance, instance));

        if let Some(thread_id) = self.thread_id {
            options.push((PreLoginOption::ThreadId, thread_id.to_be_bytes().to_vec()));
        }
        options.push((PreLoginOption::Mars, vec![u8::from(self.mars)]));

        if let Some(trace) = &self.trace_id {
            let mut data = Vec::with_capacity(36);
            data.extend_from_slice(&trace.connection_id);
            data.extend_from_slice(&trace.activity_id);
            data.extend_from_slice(&trace.activity_sequence.to_le_bytes());
            options.push((PreLoginOption::TraceId, data));
        }
        if let Some(required) = self.fed_auth_required {
            options.push((PreLoginOption::FedAuthRequired, vec![u8::from(required)]));
        }
        if let Some(nonce) = &self.nonce {
            options.push((PreLoginOption::Nonce, nonce.to_vec()));
        }
        options
    }

    /// Encode the record.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let options = self.options();
        let header_len = options.len() * OPTION_HEADER_SIZE + 1;
        let data_len: usize = options.iter().map(|(_, data)| data.len()).sum();

        let mut buf = BytesMut::with_capacity(header_len + data_len);
        let mut offset = header_len;
        for (option, data) in &options {
            buf.put_u8(*option as u8);
            buf.put_u16(offset as u16);
            buf.put_u16(data.len() as u16);
            offset += data.len();
        }
        buf.put_u8(PreLoginOption::Terminator as u8);
        for (_, data) in &options {
            buf.put_slice(data);
        }
        buf.freeze()
    }

    /// Decode a record. Unknown option tags are ignored; options pointing
    /// outside the record are an error.
    pub fn decode(mut src: impl Buf) -> Result<Self, ProtocolError> {
        let record = src.copy_to_bytes(src.remaining());
        let mut headers = record.clone();
        let mut prelogin = Self::default();
        let mut saw_encryption = false;

        loop {
            if !headers.has_remaining() {
                return Err(ProtocolError::UnexpectedEof);
            }
            let tag = headers.get_u8();
            if tag == PreLoginOption::Terminator as u8 {
                break;
            }
            if headers.remaining() < 4 {
                return Err(ProtocolError::UnexpectedEof);
            }
            let offset = headers.get_u16();
            let length = headers.get_u16();

            let start = offset as usize;
            let end = start + length as usize;
            if end > record.len() {
                return Err(ProtocolError::PreLoginOptionOutOfBounds {
                    option: tag,
                    offset,
                    length,
                });
            }
            let value = &record[start..end];
            let wrong_length = || ProtocolError::InvalidPreLoginOption {
                option: tag,
                length,
            };

            match tag {
                0x00 => {
                    if value.len() < 4 {
                        return Err(wrong_length());
                    }
                    let raw = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                    let sub_build = if value.len() >= 6 {
                        u16::from_le_bytes([value[4], value[5]])
                    } else {
                        0
                    };
                    prelogin.version = SqlServerVersion::from_raw(raw, sub_build);
                }
                0x01 => {
                    let [level] = value else {
                        return Err(wrong_length());
                    };
                    prelogin.encryption = EncryptionLevel::from_u8(*level)?;
                    saw_encryption = true;
                }
                0x02 => {
                    let name = value.split(|&b| b == 0).next().unwrap_or_default();
                    if !name.is_empty() {
                        prelogin.instance = Some(String::from_utf8_lossy(name).into_owned());
                    }
                }
                0x03 if value.len() == 4 => {
                    prelogin.thread_id =
                        Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                }
                0x04 => {
                    prelogin.mars = value.first().is_some_and(|&b| b != 0);
                }
                0x05 if value.len() == 36 => {
                    let mut connection_id = [0u8; 16];
                    let mut activity_id = [0u8; 16];
                    connection_id.copy_from_slice(&value[..16]);
                    activity_id.copy_from_slice(&value[16..32]);
                    prelogin.trace_id = Some(TraceId {
                        connection_id,
                        activity_id,
                        activity_sequence: u32::from_le_bytes([
                            value[32], value[33], value[34], value[35],
                        ]),
                    });
                }
                0x06 => {
                    let [flag] = value else {
                        return Err(wrong_length());
                    };
                    prelogin.fed_auth_required = Some(*flag != 0);
                }
                0x07 => {
                    let nonce: [u8; 32] = value.try_into().map_err(|_| wrong_length())?;
                    prelogin.nonce = Some(nonce);
                }
                _ => {}
            }
        }

        if !saw_encryption {
            return Err(ProtocolError::InvalidPreLoginOption {
                option: PreLoginOption::Encryption as u8,
                length: 0,
            });
        }
        Ok(prelogin)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let record = PreLogin::new()
            .with_encryption(EncryptionLevel::On)
            .encode();

        // VERSION, ENCRYPTION, INSTANCE, MARS headers then terminator.
        assert_eq!(record[0], PreLoginOption::Version as u8);
        assert_eq!(u16::from_be_bytes([record[1], record[2]]), 21);
        assert_eq!(u16::from_be_bytes([record[3], record[4]]), 6);
        assert_eq!(record[5], PreLoginOption::Encryption as u8);
        assert_eq!(u16::from_be_bytes([record[6], record[7]]), 27);
        assert_eq!(record[20], PreLoginOption::Terminator as u8);
        assert_eq!(record[27], EncryptionLevel::On as u8);
        // Empty instance name is a single NUL.
        assert_eq!(record[28], 0);
    }

    #[test]
    fn test_decode_options_out_of_order() {
        let mut buf = BytesMut::new();
        buf.put_u8(PreLoginOption::Encryption as u8);
        buf.put_u16(11);
        buf.put_u16(1);
        buf.put_u8(PreLoginOption::Version as u8);
        buf.put_u16(12);
        buf.put_u16(6);
        buf.put_u8(PreLoginOption::Terminator as u8);
        buf.put_u8(0x01);
        buf.put_slice(&[0x10, 0x00, 0x0F, 0xA0]);
        buf.put_u16_le(3);

        let decoded = PreLogin::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.encryption, EncryptionLevel::On);
        assert_eq!(decoded.version.major, 16);
        assert_eq!(decoded.version.build, 4000);
        assert_eq!(decoded.version.sub_build, 3);
        assert_eq!(decoded.fed_auth_required, None);
    }

    #[test]
    fn test_roundtrip_optional_options() {
        let original = PreLogin::new()
            .with_encryption(EncryptionLevel::NotSupported)
            .with_instance("SQLEXPRESS")
            .with_thread_id(42)
            .with_mars(true)
            .with_fed_auth_required(true)
            .with_nonce([7u8; 32]);

        let decoded = PreLogin::decode(original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_option_out_of_bounds() {
        let mut buf = BytesMut::new();
        buf.put_u8(PreLoginOption::Encryption as u8);
        buf.put_u16(6);
        buf.put_u16(4);
        buf.put_u8(PreLoginOption::Terminator as u8);
        buf.put_u8(0);

        assert!(matches!(
            PreLogin::decode(buf.freeze()),
            Err(ProtocolError::PreLoginOptionOutOfBounds { option: 0x01, .. })
        ));
    }

    #[test]
    fn test_fed_auth_flag_must_be_one_byte() {
        let mut buf = BytesMut::new();
        buf.put_u8(PreLoginOption::Encryption as u8);
        buf.put_u16(11);
        buf.put_u16(1);
        buf.put_u8(PreLoginOption::FedAuthRequired as u8);
        buf.put_u16(12);
        buf.put_u16(2);
        buf.put_u8(PreLoginOption::Terminator as u8);
        buf.put_u8(0);
        buf.put_slice(&[1, 1]);

        assert!(matches!(
            PreLogin::decode(buf.freeze()),
            Err(ProtocolError::InvalidPreLoginOption { option: 0x06, length: 2 })
        ));
    }

    #[test]
    fn test_missing_encryption_option() {
        let record: &[u8] = &[0xFF];
        assert!(PreLogin::decode(record).is_err());
    }

    #[test]
    fn test_missing_terminator() {
        let record: &[u8] = &[0x01, 0x00, 0x06];
        assert_eq!(
            PreLogin::decode(record),
            Err(ProtocolError::UnexpectedEof)
        );
    }
}
