//! Session state tracked from the token stream.
//!
//! [`SessionState`] is owned by one session and written only by the token
//! decoder as it applies ENVCHANGE and LOGINACK tokens. Changes are applied
//! before the corresponding event is handed to the caller.

use bytes::Bytes;
use tds_protocol::token::{Collation, EnvChange, EnvChangeType, LoginAck, RoutingTarget};
use tds_protocol::version::{SqlServerVersion, TdsVersion};

/// Server-visible state of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Negotiated packet size.
    pub packet_size: usize,
    /// Current database.
    pub database: Option<String>,
    /// Current language.
    pub language: Option<String>,
    /// Character set of non-Unicode data (pre-7.0 servers).
    pub charset: Option<String>,
    /// Default collation.
    pub collation: Option<Collation>,
    /// Unicode sort locale id.
    pub sort_locale: Option<String>,
    /// Unicode comparison flags.
    pub sort_flags: Option<String>,
    /// Active transaction descriptor, 0 when none.
    pub transaction_id: u64,
    /// Address of the DTC transaction manager.
    pub transaction_manager: Option<Bytes>,
    /// Promoted (distributed) transaction token.
    pub promoted_transaction: Option<Bytes>,
    /// Partner server for database mirroring.
    pub mirror_partner: Option<String>,
    /// User instance pipe name.
    pub user_instance: Option<String>,
    /// Number of RESETCONNECTION acknowledgements seen.
    pub resets: u32,
    /// Last routing target the server handed out.
    pub routing: Option<RoutingTarget>,
    /// TDS version selected by the server.
    pub tds_version: Option<TdsVersion>,
    /// Login acknowledgement.
    pub login_ack: Option<LoginAck>,
    /// Product version from the Pre-Login reply.
    pub server_version: Option<SqlServerVersion>,
}

/// What applying an environment change asks of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnvEffect {
    /// Nothing beyond the state update.
    None,
    /// Packet buffers must be resized before the next read.
    Resize(usize),
}

impl SessionState {
    /// Fresh state for a connection framed at `packet_size`.
    #[must_use]
    pub fn new(packet_size: usize) -> Self {
        Self {
            packet_size,
            ..Self::default()
        }
    }

    /// Whether a transaction is active.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.transaction_id != 0
    }

    /// Record a login acknowledgement.
    pub(crate) fn apply_login_ack(&mut self, ack: &LoginAck) {
        self.tds_version = Some(ack.tds_version);
        self.login_ack = Some(ack.clone());
    }

    /// Apply an environment change.
    pub(crate) fn apply_env_change(
        &mut self,
        env: &EnvChange,
    ) -> Result<EnvEffect, tds_protocol::ProtocolError> {
        let text = || env.new_value.as_text().map(str::to_owned);
        let bytes = || env.new_value.as_bytes().filter(|b| !b.is_empty()).cloned();

        match env.env_type {
            EnvChangeType::Database => self.database = text(),
            EnvChangeType::Language => self.language = text(),
            EnvChangeType::CharacterSet => self.charset = text(),
            EnvChangeType::SortLocale => self.sort_locale = text(),
            EnvChangeType::SortFlags => self.sort_flags = text(),
            EnvChangeType::RealTimeLogShipping => self.mirror_partner = text(),
            EnvChangeType::UserInstance => self.user_instance = text(),
            EnvChangeType::SqlCollation => self.collation = env.new_collation(),
            EnvChangeType::PacketSize => {
                if let Some(size) = env.new_packet_size()? {
                    let size = size as usize;
                    self.packet_size = size;
                    return Ok(EnvEffect::Resize(size));
                }
            }
            EnvChangeType::BeginTransaction | EnvChangeType::DefectTransaction => {
                self.transaction_id = transaction_id(env.new_value.as_bytes());
            }
            // These carry the finished descriptor on the old side.
            EnvChangeType::CommitTransaction
            | EnvChangeType::RollbackTransaction
            | EnvChangeType::EnlistDtcTransaction
            | EnvChangeType::TransactionEnded => {
                self.transaction_id = transaction_id(env.new_value.as_bytes());
                self.promoted_transaction = None;
            }
            EnvChangeType::PromoteTransaction => self.promoted_transaction = bytes(),
            EnvChangeType::TransactionManagerAddress => self.transaction_manager = bytes(),
            EnvChangeType::ResetConnectionAck => self.resets += 1,
            EnvChangeType::Routing => self.routing = env.routing_target().cloned(),
        }
        Ok(EnvEffect::None)
    }
}

/// Descriptor in a transaction value; empty means no transaction.
fn transaction_id(value: Option<&Bytes>) -> u64 {
    value
        .and_then(|b| b.get(..8))
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map_or(0, u64::from_le_bytes)
}

/// Where a session stands in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseState {
    /// No request outstanding.
    #[default]
    Idle,
    /// A request was sent and its response is being read.
    Reading,
    /// A response failed to decode; the session must be closed.
    Poisoned,
}

impl ResponseState {
    /// Check if the session can take a new request.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Poisoned)
    }

    /// Check if a response is outstanding.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Reading)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_database_and_language() {
        let mut state = SessionState::new(4096);
        state
            .apply_env_change(&EnvChange::text(EnvChangeType::Database, "orders", "master"))
            .unwrap();
        state
            .apply_env_change(&EnvChange::text(EnvChangeType::Language, "us_english", ""))
            .unwrap();
        assert_eq!(state.database.as_deref(), Some("orders"));
        assert_eq!(state.language.as_deref(), Some("us_english"));
    }

    #[test]
    fn test_packet_size_requests_resize() {
        let mut state = SessionState::new(4096);
        let effect = state.apply_env_change(&EnvChange::packet_size(8192, 4096)).unwrap();
        assert_eq!(effect, EnvEffect::Resize(8192));
        assert_eq!(state.packet_size, 8192);
    }

    #[test]
    fn test_transaction_lifecycle() {
        let mut state = SessionState::new(4096);
        state
            .apply_env_change(&EnvChange::transaction(EnvChangeType::BeginTransaction, 0x2A))
            .unwrap();
        assert!(state.in_transaction());
        assert_eq!(state.transaction_id, 0x2A);

        state
            .apply_env_change(&EnvChange::transaction(EnvChangeType::CommitTransaction, 0x2A))
            .unwrap();
        assert!(!state.in_transaction());
    }

    #[test]
    fn test_routing_target_is_kept() {
        let mut state = SessionState::new(4096);
        state
            .apply_env_change(&EnvChange::routing("replica.example.com", 11000))
            .unwrap();
        let target = state.routing.unwrap();
        assert_eq!(target.host, "replica.example.com");
        assert_eq!(target.port, 11000);
    }

    #[test]
    fn test_response_state() {
        assert!(ResponseState::Idle.is_usable());
        assert!(ResponseState::Reading.is_busy());
        assert!(!ResponseState::Poisoned.is_usable());
    }
}
