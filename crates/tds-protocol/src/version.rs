//! Protocol and server version numbers.

use core::fmt;

/// TDS protocol version as carried in LOGIN7 and LOGINACK.
///
/// LOGIN7 sends the value little-endian; LOGINACK echoes it big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.0 (SQL Server 7.0)
    pub const V7_0: Self = Self(0x7000_0000);
    /// TDS 7.1 (SQL Server 2000)
    pub const V7_1: Self = Self(0x7100_0000);
    /// TDS 7.2 (SQL Server 2005)
    pub const V7_2: Self = Self(0x7209_0002);
    /// TDS 7.3A (SQL Server 2008)
    pub const V7_3A: Self = Self(0x730A_0003);
    /// TDS 7.3B (SQL Server 2008 R2)
    pub const V7_3B: Self = Self(0x730B_0003);
    /// TDS 7.4 (SQL Server 2012+)
    pub const V7_4: Self = Self(0x7400_0004);

    /// Wrap a raw version value.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// Raw version value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Minor version, taken from the top byte's low nibble.
    #[must_use]
    pub const fn minor(self) -> u8 {
        ((self.0 >> 24) & 0x0F) as u8
    }

    /// Whether the server supports the feature extension block (7.4+).
    #[must_use]
    pub const fn supports_feature_ext(self) -> bool {
        self.0 >= Self::V7_4.0
    }

    fn revision_suffix(self) -> Option<char> {
        match self.0 {
            0x730A_0003 => Some('A'),
            0x730B_0003 => Some('B'),
            _ => None,
        }
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_4
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.revision_suffix() {
            Some(suffix) => write!(f, "TDS 7.{}{}", self.minor(), suffix),
            None => write!(f, "TDS 7.{}", self.minor()),
        }
    }
}

impl From<u32> for TdsVersion {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// SQL Server product version from the Pre-Login VERSION option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SqlServerVersion {
    /// Major version (16 for SQL Server 2022).
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build number.
    pub build: u16,
    /// Sub-build number.
    pub sub_build: u16,
}

impl SqlServerVersion {
    /// Build from the option's leading big-endian u32 and trailing sub-build.
    #[must_use]
    pub const fn from_raw(version: u32, sub_build: u16) -> Self {
        Self {
            major: (version >> 24) as u8,
            minor: (version >> 16) as u8,
            build: version as u16,
            sub_build,
        }
    }

    /// Leading u32 of the VERSION option.
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        ((self.major as u32) << 24) | ((self.minor as u32) << 16) | self.build as u32
    }

    /// Marketing name for the major version.
    #[must_use]
    pub const fn product_name(&self) -> &'static str {
        match self.major {
            9 => "SQL Server 2005",
            10 => "SQL Server 2008",
            11 => "SQL Server 2012",
            12 => "SQL Server 2014",
            13 => "SQL Server 2016",
            14 => "SQL Server 2017",
            15 => "SQL Server 2019",
            16 => "SQL Server 2022",
            _ => "SQL Server",
        }
    }
}

impl fmt::Display for SqlServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.sub_build
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        assert!(TdsVersion::V7_4 > TdsVersion::V7_3B);
        assert!(TdsVersion::V7_3B > TdsVersion::V7_3A);
        assert!(TdsVersion::V7_3A > TdsVersion::V7_2);
    }

    #[test]
    fn test_display() {
        assert_eq!(TdsVersion::V7_4.to_string(), "TDS 7.4");
        assert_eq!(TdsVersion::V7_3B.to_string(), "TDS 7.3B");
        assert_eq!(TdsVersion::V7_1.to_string(), "TDS 7.1");
    }

    #[test]
    fn test_feature_ext_support() {
        assert!(TdsVersion::V7_4.supports_feature_ext());
        assert!(!TdsVersion::V7_3B.supports_feature_ext());
    }

    #[test]
    fn test_sql_server_version_raw() {
        let version = SqlServerVersion::from_raw(0x1000_0FA0, 7);
        assert_eq!(version.major, 16);
        assert_eq!(version.minor, 0);
        assert_eq!(version.build, 4000);
        assert_eq!(version.to_raw(), 0x1000_0FA0);
        assert_eq!(version.product_name(), "SQL Server 2022");
        assert_eq!(version.to_string(), "16.0.4000.7");
    }
}
