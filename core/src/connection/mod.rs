//! The `Connection` object and its state machine, owned exclusively by the
//! `ConnectionManager` (C6, spec §3, §4.6, §9).

mod manager;
mod state;
mod system_handler;

pub use manager::{ConnectionHandle, ConnectionManager, SendError};
pub use state::ConnectionState;
pub use system_handler::SystemHandler;

use std::time::Instant;
use uuid::Uuid;

/// Ephemeral, one per accepted WebSocket (spec §3). Context only ever stores
/// `connectionId`; the manager is the single owner of this struct to avoid the
/// connection/manager/context/runner ownership cycle (spec §9).
#[derive(Clone, Debug)]
pub struct Connection {
    pub connection_id: Uuid,
    pub user_id: String,
    pub access_token: Option<String>,
    pub conversation_id: Option<String>,
    pub definition_id: Option<String>,
    pub state: ConnectionState,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub missed_pong_count: u32,
}

impl Connection {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            connection_id: Uuid::new_v4(),
            user_id: user_id.into(),
            access_token: None,
            conversation_id: None,
            definition_id: None,
            state: ConnectionState::Connecting,
            created_at: now,
            last_activity_at: now,
            missed_pong_count: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    pub fn accepts_inbound(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Authenticated | ConnectionState::Active | ConnectionState::Paused
        )
    }

    pub fn accepts_outbound(&self) -> bool {
        !matches!(self.state, ConnectionState::Closed)
    }
}
