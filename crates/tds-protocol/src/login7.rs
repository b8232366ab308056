//! LOGIN7 record.
//!
//! A 94 byte fixed header declares an `(offset, length)` pair for every
//! variable field; the UCS-2 field data follows the header. Lengths are in
//! characters except for the SSPI blob, which is in bytes. When the
//! EXTENSION flag is set, the extension slot holds a 4 byte pointer to the
//! feature extension block at the end of the record.
//!
//! Passwords are obfuscated, not encrypted: every byte of the UTF-16LE
//! password has its nibbles swapped and is XORed with `0xA5`.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{decode_ucs2, encode_ucs2};
use crate::error::ProtocolError;
use crate::feature_ext::FeatureExtensions;
use crate::packet::DEFAULT_PACKET_SIZE;
use crate::version::TdsVersion;

/// Size of the fixed LOGIN7 header.
pub const LOGIN7_HEADER_SIZE: usize = 94;

bitflags! {
    /// OptionFlags1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OptionFlags1: u8 {
        /// Big-endian byte order.
        const BYTE_ORDER_68000 = 0x01;
        /// EBCDIC character set.
        const CHAR_EBCDIC = 0x02;
        /// VAX floating point.
        const FLOAT_VAX = 0x04;
        /// ND5000 floating point.
        const FLOAT_ND5000 = 0x08;
        /// Disable dump/load.
        const DUMP_LOAD_OFF = 0x10;
        /// Warn on database change.
        const USE_DB_NOTIFY = 0x20;
        /// Fail login if the initial database is unavailable.
        const INIT_DB_FATAL = 0x40;
        /// Warn on language change.
        const SET_LANG_ON = 0x80;
    }
}

bitflags! {
    /// OptionFlags2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OptionFlags2: u8 {
        /// Fail login if the language is unavailable.
        const INIT_LANG_FATAL = 0x01;
        /// ODBC client behavior (unlimited TEXTSIZE and friends).
        const ODBC = 0x02;
        /// Cache connection.
        const CACHE_CONNECT = 0x08;
        /// Remote user type bits.
        const USER_TYPE_SERVER = 0x10;
        /// Integrated (SSPI) security.
        const INTEGRATED_SECURITY = 0x80;
    }
}

bitflags! {
    /// TypeFlags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeFlags: u8 {
        /// OLEDB client.
        const OLEDB = 0x10;
        /// Read-only application intent.
        const READ_ONLY_INTENT = 0x20;
    }
}

bitflags! {
    /// OptionFlags3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OptionFlags3: u8 {
        /// Change the password during login.
        const CHANGE_PASSWORD = 0x01;
        /// User instance.
        const USER_INSTANCE = 0x02;
        /// Binary XML.
        const SEND_YUKON_BINARY_XML = 0x04;
        /// Tolerate unknown collations.
        const UNKNOWN_COLLATION_HANDLING = 0x08;
        /// Feature extension block present.
        const EXTENSION = 0x10;
    }
}

/// A LOGIN7 request. Short-lived: built per connection attempt, encoded,
/// then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login7 {
    /// Requested protocol version.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client driver version.
    pub client_prog_version: u32,
    /// Client process id.
    pub client_pid: u32,
    /// Connection id.
    pub connection_id: u32,
    /// OptionFlags1.
    pub option_flags1: OptionFlags1,
    /// OptionFlags2.
    pub option_flags2: OptionFlags2,
    /// TypeFlags.
    pub type_flags: TypeFlags,
    /// OptionFlags3.
    pub option_flags3: OptionFlags3,
    /// Minutes east of UTC.
    pub client_timezone: i32,
    /// Client locale id.
    pub client_lcid: u32,
    /// Workstation name.
    pub hostname: String,
    /// SQL login name.
    pub username: String,
    /// SQL login password, in clear until encoded.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as the client addressed it.
    pub server_name: String,
    /// Client interface library name.
    pub library_name: String,
    /// Initial language.
    pub language: String,
    /// Initial database.
    pub database: String,
    /// Client MAC address or zeros.
    pub client_id: [u8; 6],
    /// Initial SSPI blob for integrated security.
    pub sspi: Bytes,
    /// Database file to attach.
    pub attach_db_file: String,
    /// New password when changing it.
    pub change_password: String,
    /// Feature extension block.
    pub features: FeatureExtensions,
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::V7_4,
            packet_size: DEFAULT_PACKET_SIZE as u32,
            client_prog_version: 0,
            client_pid: std::process::id(),
            connection_id: 0,
            option_flags1: OptionFlags1::USE_DB_NOTIFY | OptionFlags1::INIT_DB_FATAL,
            option_flags2: OptionFlags2::INIT_LANG_FATAL | OptionFlags2::ODBC,
            type_flags: TypeFlags::empty(),
            option_flags3: OptionFlags3::UNKNOWN_COLLATION_HANDLING,
            client_timezone: 0,
            client_lcid: 0x0409,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::new(),
            server_name: String::new(),
            library_name: String::from("tds-client"),
            language: String::new(),
            database: String::new(),
            client_id: [0; 6],
            sspi: Bytes::new(),
            attach_db_file: String::new(),
            change_password: String::new(),
            features: FeatureExtensions::new(),
        }
    }
}

/// Variable-section builder that tracks absolute offsets.
struct VarSection {
    data: BytesMut,
}

impl VarSection {
    fn offset(&self) -> usize {
        LOGIN7_HEADER_SIZE + self.data.len()
    }

    /// Append a UCS-2 field, returning `(offset, char count)`.
    fn text(&mut self, value: &str, field: &'static str) -> Result<(u16, u16), ProtocolError> {
        self.bytes(&encode_ucs2(value), field)
            .map(|(offset, len)| (offset, len / 2))
    }

    fn password(&mut self, value: &str, field: &'static str) -> Result<(u16, u16), ProtocolError> {
        let mut encoded = encode_ucs2(value);
        obfuscate_password(&mut encoded);
        self.bytes(&encoded, field).map(|(offset, len)| (offset, len / 2))
    }

    fn bytes(&mut self, value: &[u8], field: &'static str) -> Result<(u16, u16), ProtocolError> {
        let offset = to_u16(self.offset(), "LOGIN7")?;
        let len = to_u16(value.len(), field)?;
        self.data.put_slice(value);
        Ok((offset, len))
    }
}

fn to_u16(value: usize, field: &'static str) -> Result<u16, ProtocolError> {
    u16::try_from(value).map_err(|_| ProtocolError::ValueTooLarge {
        field,
        len: value,
        max: u16::MAX as usize,
    })
}

/// Apply the LOGIN7 password transform in place.
pub fn obfuscate_password(bytes: &mut [u8]) {
    for byte in bytes {
        *byte = byte.rotate_right(4) ^ 0xA5;
    }
}

/// Undo [`obfuscate_password`] in place.
pub fn deobfuscate_password(bytes: &mut [u8]) {
    for byte in bytes {
        *byte = (*byte ^ 0xA5).rotate_left(4);
    }
}

impl Login7 {
    /// Defaults: TDS 7.4, 4096 byte packets, ODBC flags.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use SQL Server authentication.
    #[must_use]
    pub fn with_sql_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self.option_flags2.remove(OptionFlags2::INTEGRATED_SECURITY);
        self
    }

    /// Use integrated security with an initial SSPI blob.
    #[must_use]
    pub fn with_sspi(mut self, sspi: impl Into<Bytes>) -> Self {
        self.sspi = sspi.into();
        self.option_flags2.insert(OptionFlags2::INTEGRATED_SECURITY);
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the workstation name.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the initial language.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Set the client locale id.
    #[must_use]
    pub fn with_client_lcid(mut self, lcid: u32) -> Self {
        self.client_lcid = lcid;
        self
    }

    /// Declare read-only application intent.
    #[must_use]
    pub fn with_read_only_intent(mut self, read_only: bool) -> Self {
        self.type_flags.set(TypeFlags::READ_ONLY_INTENT, read_only);
        self
    }

    /// Attach a feature extension block.
    #[must_use]
    pub fn with_features(mut self, features: FeatureExtensions) -> Self {
        self.features = features;
        self
    }

    /// Encode the record.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let has_features = !self.features.is_empty();
        let mut flags3 = self.option_flags3;
        flags3.set(OptionFlags3::EXTENSION, has_features);
        flags3.set(OptionFlags3::CHANGE_PASSWORD, !self.change_password.is_empty());

        let mut var = VarSection {
            data: BytesMut::with_capacity(256),
        };
        let hostname = var.text(&self.hostname, "hostname")?;
        let username = var.text(&self.username, "username")?;
        let password = var.password(&self.password, "password")?;
        let app_name = var.text(&self.app_name, "app_name")?;
        let server_name = var.text(&self.server_name, "server_name")?;
        // Patched below once the feature block offset is known.
        let extension = if has_features {
            var.bytes(&[0; 4], "extension")?
        } else {
            (to_u16(var.offset(), "LOGIN7")?, 0)
        };
        let library_name = var.text(&self.library_name, "library_name")?;
        let language = var.text(&self.language, "language")?;
        let database = var.text(&self.database, "database")?;

        let sspi_offset = to_u16(var.offset(), "LOGIN7")?;
        let (sspi_len, sspi_long) = match u16::try_from(self.sspi.len()) {
            Ok(len) if len < u16::MAX => (len, 0),
            _ => (u16::MAX, self.sspi.len() as u32),
        };
        var.data.put_slice(&self.sspi);

        let attach_db = var.text(&self.attach_db_file, "attach_db_file")?;
        let change_password = var.password(&self.change_password, "change_password")?;

        if has_features {
            let block_offset = var.offset() as u32;
            let pointer = extension.0 as usize - LOGIN7_HEADER_SIZE;
            var.data[pointer..pointer + 4].copy_from_slice(&block_offset.to_le_bytes());
            var.data.put_slice(&self.features.encode());
        }

        let total_length = LOGIN7_HEADER_SIZE + var.data.len();
        let mut buf = BytesMut::with_capacity(total_length);
        buf.put_u32_le(total_length as u32);
        buf.put_u32_le(self.tds_version.raw());
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(self.client_prog_version);
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(self.connection_id);
        buf.put_u8(self.option_flags1.bits());
        buf.put_u8(self.option_flags2.bits());
        buf.put_u8(self.type_flags.bits());
        buf.put_u8(flags3.bits());
        buf.put_i32_le(self.client_timezone);
        buf.put_u32_le(self.client_lcid);

        for (offset, len) in [hostname, username, password, app_name, server_name, extension] {
            buf.put_u16_le(offset);
            buf.put_u16_le(len);
        }
        for (offset, len) in [library_name, language, database] {
            buf.put_u16_le(offset);
            buf.put_u16_le(len);
        }
        buf.put_slice(&self.client_id);
        buf.put_u16_le(sspi_offset);
        buf.put_u16_le(sspi_len);
        for (offset, len) in [attach_db, change_password] {
            buf.put_u16_le(offset);
            buf.put_u16_le(len);
        }
        buf.put_u32_le(sspi_long);

        buf.put_slice(&var.data);
        Ok(buf.freeze())
    }

    /// Decode a record, reversing the password transform. Used by test
    /// servers and tooling that inspect what a client sent.
    pub fn decode(mut src: impl Buf) -> Result<Self, ProtocolError> {
        let record = src.copy_to_bytes(src.remaining());
        if record.len() < LOGIN7_HEADER_SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: LOGIN7_HEADER_SIZE,
                actual: record.len(),
            });
        }
        let mut header = record.slice(..LOGIN7_HEADER_SIZE);

        let _length = header.get_u32_le();
        let tds_version = TdsVersion::new(header.get_u32_le());
        let packet_size = header.get_u32_le();
        let client_prog_version = header.get_u32_le();
        let client_pid = header.get_u32_le();
        let connection_id = header.get_u32_le();
        let option_flags1 = OptionFlags1::from_bits_retain(header.get_u8());
        let option_flags2 = OptionFlags2::from_bits_retain(header.get_u8());
        let type_flags = TypeFlags::from_bits_retain(header.get_u8());
        let option_flags3 = OptionFlags3::from_bits_retain(header.get_u8());
        let client_timezone = header.get_i32_le();
        let client_lcid = header.get_u32_le();

        let mut slots = [(0u16, 0u16); 9];
        for slot in &mut slots {
            *slot = (header.get_u16_le(), header.get_u16_le());
        }
        let mut client_id = [0u8; 6];
        header.copy_to_slice(&mut client_id);
        let sspi_slot = (header.get_u16_le(), header.get_u16_le());
        let attach_slot = (header.get_u16_le(), header.get_u16_le());
        let change_slot = (header.get_u16_le(), header.get_u16_le());
        let sspi_long = header.get_u32_le();

        let field = |(offset, len): (u16, u16), bytes_per_unit: usize| {
            let start = offset as usize;
            let end = start + len as usize * bytes_per_unit;
            record
                .get(start..end)
                .map(|_| record.slice(start..end))
                .ok_or(ProtocolError::IncompletePacket {
                    expected: end,
                    actual: record.len(),
                })
        };
        let text = |slot: (u16, u16)| field(slot, 2).and_then(|raw| decode_ucs2(&raw));
        let password = |slot: (u16, u16)| {
            field(slot, 2).and_then(|raw| {
                let mut raw = raw.to_vec();
                deobfuscate_password(&mut raw);
                decode_ucs2(&raw)
            })
        };

        let sspi = if sspi_slot.1 == u16::MAX && sspi_long > 0 {
            let start = sspi_slot.0 as usize;
            let end = start + sspi_long as usize;
            record.get(start..end).ok_or(ProtocolError::UnexpectedEof)?;
            record.slice(start..end)
        } else {
            field(sspi_slot, 1)?
        };

        let features = if option_flags3.contains(OptionFlags3::EXTENSION) {
            let mut pointer = field(slots[5], 1)?;
            if pointer.remaining() < 4 {
                return Err(ProtocolError::UnexpectedEof);
            }
            let block_offset = pointer.get_u32_le() as usize;
            let mut block = record
                .get(block_offset..)
                .map(|_| record.slice(block_offset..))
                .ok_or(ProtocolError::UnexpectedEof)?;
            FeatureExtensions::decode(&mut block)?
        } else {
            FeatureExtensions::new()
        };

        Ok(Self {
            tds_version,
            packet_size,
            client_prog_version,
            client_pid,
            connection_id,
            option_flags1,
            option_flags2,
            type_flags,
            option_flags3: option_flags3 - OptionFlags3::EXTENSION - OptionFlags3::CHANGE_PASSWORD,
            client_timezone,
            client_lcid,
            hostname: text(slots[0])?,
            username: text(slots[1])?,
            password: password(slots[2])?,
            app_name: text(slots[3])?,
            server_name: text(slots[4])?,
            library_name: text(slots[6])?,
            language: text(slots[7])?,
            database: text(slots[8])?,
            client_id,
            sspi,
            attach_db_file: text(attach_slot)?,
            change_password: password(change_slot)?,
            features,
        })
    }
}
