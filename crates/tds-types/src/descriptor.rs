//! TYPE_INFO descriptors.

use tds_protocol::token::Collation;

/// TDS data type ids handled by [`StandardRegistry`](crate::StandardRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[non_exhaustive]
pub enum TypeId {
    /// NULLTYPE.
    Null = 0x1F,
    /// INT1TYPE.
    TinyInt = 0x30,
    /// BITTYPE.
    Bit = 0x32,
    /// INT2TYPE.
    SmallInt = 0x34,
    /// INT4TYPE.
    Int = 0x38,
    /// FLT4TYPE.
    Real = 0x3B,
    /// FLT8TYPE.
    Float = 0x3E,
    /// INT8TYPE.
    BigInt = 0x7F,
    /// GUIDTYPE.
    Guid = 0x24,
    /// INTNTYPE.
    IntN = 0x26,
    /// BITNTYPE.
    BitN = 0x68,
    /// FLTNTYPE.
    FloatN = 0x6D,
    /// BIGVARBINARYTYPE.
    BigVarBinary = 0xA5,
    /// BIGVARCHARTYPE.
    BigVarChar = 0xA7,
    /// BIGBINARYTYPE.
    BigBinary = 0xAD,
    /// BIGCHARTYPE.
    BigChar = 0xAF,
    /// NVARCHARTYPE.
    NVarChar = 0xE7,
    /// NCHARTYPE.
    NChar = 0xEF,
}

/// How the length of a value is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthKind {
    /// Fixed size, no prefix.
    Fixed(usize),
    /// One-byte length prefix, 0 means NULL.
    Byte,
    /// Two-byte length prefix, 0xFFFF means NULL.
    UShort,
    /// Partially length-prefixed (the `MAX` variants).
    Plp,
}

impl TypeId {
    /// Map a wire byte to a type id.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x1F => Self::Null,
            0x30 => Self::TinyInt,
            0x32 => Self::Bit,
            0x34 => Self::SmallInt,
            0x38 => Self::Int,
            0x3B => Self::Real,
            0x3E => Self::Float,
            0x7F => Self::BigInt,
            0x24 => Self::Guid,
            0x26 => Self::IntN,
            0x68 => Self::BitN,
            0x6D => Self::FloatN,
            0xA5 => Self::BigVarBinary,
            0xA7 => Self::BigVarChar,
            0xAD => Self::BigBinary,
            0xAF => Self::BigChar,
            0xE7 => Self::NVarChar,
            0xEF => Self::NChar,
            _ => return None,
        })
    }

    /// Size of fixed-length types.
    #[must_use]
    pub const fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Null => Some(0),
            Self::TinyInt | Self::Bit => Some(1),
            Self::SmallInt => Some(2),
            Self::Int | Self::Real => Some(4),
            Self::BigInt | Self::Float => Some(8),
            _ => None,
        }
    }

    /// Whether TYPE_INFO carries a collation.
    #[must_use]
    pub const fn has_collation(self) -> bool {
        matches!(
            self,
            Self::BigVarChar | Self::BigChar | Self::NVarChar | Self::NChar
        )
    }

    /// Whether TYPE_INFO carries a two-byte maximum length.
    #[must_use]
    pub const fn has_ushort_length(self) -> bool {
        matches!(
            self,
            Self::BigVarBinary
                | Self::BigVarChar
                | Self::BigBinary
                | Self::BigChar
                | Self::NVarChar
                | Self::NChar
        )
    }
}

/// Maximum length marking a `MAX` (PLP) column.
pub const MAX_LENGTH_PLP: u32 = 0xFFFF;

/// Column or parameter type as described by TYPE_INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// Type id.
    pub type_id: TypeId,
    /// Declared maximum length in bytes; 0 for fixed types.
    pub max_length: u32,
    /// Collation of character types.
    pub collation: Option<Collation>,
}

impl TypeDescriptor {
    /// Descriptor for a fixed-length type.
    #[must_use]
    pub fn fixed(type_id: TypeId) -> Self {
        Self {
            type_id,
            max_length: 0,
            collation: None,
        }
    }

    /// Nullable integer of `size` bytes (1, 2, 4 or 8).
    #[must_use]
    pub fn intn(size: u8) -> Self {
        Self {
            type_id: TypeId::IntN,
            max_length: u32::from(size),
            collation: None,
        }
    }

    /// Nullable bit.
    #[must_use]
    pub fn bitn() -> Self {
        Self {
            type_id: TypeId::BitN,
            max_length: 1,
            collation: None,
        }
    }

    /// Nullable float of `size` bytes (4 or 8).
    #[must_use]
    pub fn floatn(size: u8) -> Self {
        Self {
            type_id: TypeId::FloatN,
            max_length: u32::from(size),
            collation: None,
        }
    }

    /// UNIQUEIDENTIFIER.
    #[must_use]
    pub fn guid() -> Self {
        Self {
            type_id: TypeId::Guid,
            max_length: 16,
            collation: None,
        }
    }

    /// NVARCHAR(`chars`); pass [`MAX_LENGTH_PLP`] for NVARCHAR(MAX).
    #[must_use]
    pub fn nvarchar(chars: u32) -> Self {
        let max_length = if chars == MAX_LENGTH_PLP {
            MAX_LENGTH_PLP
        } else {
            chars * 2
        };
        Self {
            type_id: TypeId::NVarChar,
            max_length,
            collation: Some(Collation::default()),
        }
    }

    /// VARCHAR(`len`) in the given collation.
    #[must_use]
    pub fn varchar(len: u32, collation: Collation) -> Self {
        Self {
            type_id: TypeId::BigVarChar,
            max_length: len,
            collation: Some(collation),
        }
    }

    /// VARBINARY(`len`).
    #[must_use]
    pub fn varbinary(len: u32) -> Self {
        Self {
            type_id: TypeId::BigVarBinary,
            max_length: len,
            collation: None,
        }
    }

    /// How values of this type are length-prefixed.
    #[must_use]
    pub fn length_kind(&self) -> LengthKind {
        if let Some(size) = self.type_id.fixed_size() {
            LengthKind::Fixed(size)
        } else if self.type_id.has_ushort_length() {
            if self.max_length == MAX_LENGTH_PLP {
                LengthKind::Plp
            } else {
                LengthKind::UShort
            }
        } else {
            LengthKind::Byte
        }
    }

    /// Single-byte encoding for VARCHAR/CHAR data in this collation.
    #[must_use]
    pub fn encoding(&self) -> &'static encoding_rs::Encoding {
        self.collation
            .map_or(encoding_rs::WINDOWS_1252, |c| encoding_for_collation(&c))
    }
}

const UTF8_COLLATION_FLAG: u32 = 0x0400_0000;

/// Character encoding implied by a collation.
///
/// UTF-8 collations win; otherwise the Windows code page of the LCID's
/// primary language is used, falling back to 1252.
#[must_use]
pub fn encoding_for_collation(collation: &Collation) -> &'static encoding_rs::Encoding {
    if collation.info & UTF8_COLLATION_FLAG != 0 {
        return encoding_rs::UTF_8;
    }
    match code_page_for_lcid(collation.lcid()) {
        874 => encoding_rs::WINDOWS_874,
        932 => encoding_rs::SHIFT_JIS,
        936 => encoding_rs::GBK,
        949 => encoding_rs::EUC_KR,
        950 => encoding_rs::BIG5,
        1250 => encoding_rs::WINDOWS_1250,
        1251 => encoding_rs::WINDOWS_1251,
        1253 => encoding_rs::WINDOWS_1253,
        1254 => encoding_rs::WINDOWS_1254,
        1255 => encoding_rs::WINDOWS_1255,
        1256 => encoding_rs::WINDOWS_1256,
        1257 => encoding_rs::WINDOWS_1257,
        1258 => encoding_rs::WINDOWS_1258,
        _ => encoding_rs::WINDOWS_1252,
    }
}

fn code_page_for_lcid(lcid: u32) -> u16 {
    match lcid & 0x3FF {
        0x11 => 932,
        // Chinese: PRC and Singapore are simplified, the rest traditional.
        0x04 if lcid == 0x0804 || lcid == 0x1004 => 936,
        0x04 => 950,
        0x12 => 949,
        0x1E => 874,
        0x2A => 1258,
        // Serbian and Bosnian Cyrillic share the Croatian primary id.
        0x1A if matches!(lcid, 0x0C1A | 0x1C1A | 0x201A) => 1251,
        0x05 | 0x0E | 0x15 | 0x18 | 0x1A | 0x1B | 0x1C | 0x24 => 1250,
        0x02 | 0x19 | 0x22 | 0x23 | 0x2F | 0x3F | 0x40 | 0x44 | 0x50 => 1251,
        0x08 => 1253,
        0x1F | 0x2C => 1254,
        0x0D => 1255,
        0x01 | 0x20 | 0x29 => 1256,
        0x25..=0x27 => 1257,
        _ => 1252,
    }
}
