//! Token-id dispatch table.
//!
//! Each decoder owns its table, so sessions talking to servers with
//! different quirks can register different tokens side by side.

use tds_protocol::token::TokenType;

/// Width of a token's length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefix {
    /// One byte.
    U8,
    /// Two bytes, little-endian.
    U16,
    /// Four bytes, little-endian.
    U32,
}

/// How the decoder handles a token id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenKind {
    /// COLMETADATA.
    ColMetadata,
    /// ROW.
    Row,
    /// NBCROW.
    NbcRow,
    /// DONE.
    Done,
    /// DONEPROC.
    DoneProc,
    /// DONEINPROC.
    DoneInProc,
    /// ERROR.
    Error,
    /// INFO.
    Info,
    /// ENVCHANGE.
    EnvChange,
    /// LOGINACK.
    LoginAck,
    /// FEATUREEXTACK.
    FeatureExtAck,
    /// RETURNSTATUS.
    ReturnStatus,
    /// RETURNVALUE.
    ReturnValue,
    /// ORDER.
    Order,
    /// SSPI.
    Sspi,
    /// FEDAUTHINFO.
    FedAuthInfo,
    /// Length-prefixed token surfaced as [`ProtocolEvent::Opaque`](crate::ProtocolEvent::Opaque).
    Opaque(LengthPrefix),
    /// Length-prefixed token read and dropped.
    Skip(LengthPrefix),
}

/// Token id to [`TokenKind`] mapping.
#[derive(Clone)]
pub struct DispatchTable {
    entries: [Option<TokenKind>; 256],
}

impl DispatchTable {
    /// Table with no tokens registered.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: [None; 256],
        }
    }

    /// Table for the tokens a TDS 7.x server sends.
    #[must_use]
    pub fn standard() -> Self {
        let mut table = Self::empty();
        for (token, kind) in [
            (TokenType::ColMetaData, TokenKind::ColMetadata),
            (TokenType::Row, TokenKind::Row),
            (TokenType::NbcRow, TokenKind::NbcRow),
            (TokenType::Done, TokenKind::Done),
            (TokenType::DoneProc, TokenKind::DoneProc),
            (TokenType::DoneInProc, TokenKind::DoneInProc),
            (TokenType::Error, TokenKind::Error),
            (TokenType::Info, TokenKind::Info),
            (TokenType::EnvChange, TokenKind::EnvChange),
            (TokenType::LoginAck, TokenKind::LoginAck),
            (TokenType::FeatureExtAck, TokenKind::FeatureExtAck),
            (TokenType::ReturnStatus, TokenKind::ReturnStatus),
            (TokenType::ReturnValue, TokenKind::ReturnValue),
            (TokenType::Order, TokenKind::Order),
            (TokenType::Sspi, TokenKind::Sspi),
            (TokenType::FedAuthInfo, TokenKind::FedAuthInfo),
        ] {
            table.register(token as u8, kind);
        }
        table
    }

    /// Map `token` to `kind`, returning the previous mapping.
    pub fn register(&mut self, token: u8, kind: TokenKind) -> Option<TokenKind> {
        self.entries[usize::from(token)].replace(kind)
    }

    /// Forget `token`; it becomes a protocol violation.
    pub fn remove(&mut self, token: u8) -> Option<TokenKind> {
        self.entries[usize::from(token)].take()
    }

    /// How `token` is handled.
    #[must_use]
    pub fn lookup(&self, token: u8) -> Option<TokenKind> {
        self.entries[usize::from(token)]
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .enumerate()
                    .filter_map(|(id, kind)| kind.map(|k| (format!("0x{id:02X}"), k))),
            )
            .finish()
    }
}
