//! Accepts, indexes, and heartbeats connections; the single owner of every
//! [`Connection`] object (spec §4.6, §9).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::{Connection, ConnectionState};
use crate::protocol::ProtocolMessage;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection {0} not found")]
    NotFound(Uuid),
    #[error("connection {0} does not accept outbound messages in its current state")]
    NotSendable(Uuid),
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// A registered connection: the manager-owned state plus the outbound channel
/// that feeds the axum socket-writer task (kept outside `core` in `serve`).
/// Order on this channel is emit order, satisfying the per-connection send
/// ordering guarantee (spec §5) without an explicit mutex — `mpsc` already
/// serializes.
pub struct ConnectionHandle {
    pub connection: Arc<Mutex<Connection>>,
    outbound: mpsc::UnboundedSender<ProtocolMessage>,
}

/// Process-wide registry of live connections, indexed by `connectionId` and by
/// `userId` (spec §3, §4.6). One instance per server process.
pub struct ConnectionManager {
    by_id: DashMap<Uuid, ConnectionHandle>,
    by_user: DashMap<String, Vec<Uuid>>,
    by_conversation: DashMap<String, Vec<Uuid>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_user: DashMap::new(),
            by_conversation: DashMap::new(),
        }
    }

    /// Registers a newly authenticated connection and returns its id. Callers
    /// drive the `CONNECTING → CONNECTED → AUTHENTICATED → ACTIVE` transitions
    /// themselves before calling this (spec §4.6 accept path).
    pub fn register(
        &self,
        connection: Connection,
        outbound: mpsc::UnboundedSender<ProtocolMessage>,
    ) -> Uuid {
        let id = connection.connection_id;
        let user_id = connection.user_id.clone();
        self.by_id.insert(
            id,
            ConnectionHandle {
                connection: Arc::new(Mutex::new(connection)),
                outbound,
            },
        );
        self.by_user.entry(user_id).or_default().push(id);
        id
    }

    pub fn bind_conversation(&self, connection_id: Uuid, conversation_id: impl Into<String>) {
        let conversation_id = conversation_id.into();
        self.by_conversation
            .entry(conversation_id.clone())
            .or_default()
            .push(connection_id);
        if let Some(handle) = self.by_id.get(&connection_id) {
            if let Ok(mut conn) = handle.connection.try_lock() {
                conn.conversation_id = Some(conversation_id);
            }
        }
    }

    pub fn get(&self, connection_id: Uuid) -> Option<Arc<Mutex<Connection>>> {
        self.by_id.get(&connection_id).map(|h| h.connection.clone())
    }

    /// Attempts a state transition; refuses (and logs) an illegal one (spec §4.6).
    pub async fn transition(&self, connection_id: Uuid, next: ConnectionState) -> bool {
        let Some(handle) = self.by_id.get(&connection_id) else {
            return false;
        };
        let mut conn = handle.connection.lock().await;
        if conn.state.can_transition_to(next) {
            conn.state = next;
            true
        } else {
            tracing::warn!(connection_id = %connection_id, from = ?conn.state, to = ?next, "illegal connection state transition refused");
            false
        }
    }

    /// Every received `system.pong` resets `missedPongCount` (spec §4.6).
    pub async fn record_pong(&self, connection_id: Uuid) {
        if let Some(handle) = self.by_id.get(&connection_id) {
            let mut conn = handle.connection.lock().await;
            conn.missed_pong_count = 0;
            conn.touch();
        }
    }

    /// Increments the missed-pong counter and returns whether the connection
    /// should now be force-closed (`missedPongCount >= maxMissedPongs`).
    pub async fn record_missed_pong(&self, connection_id: Uuid, max_missed_pongs: u32) -> bool {
        let Some(handle) = self.by_id.get(&connection_id) else {
            return false;
        };
        let mut conn = handle.connection.lock().await;
        conn.missed_pong_count += 1;
        conn.missed_pong_count >= max_missed_pongs
    }

    pub async fn send_to_connection(
        &self,
        connection_id: Uuid,
        msg: ProtocolMessage,
    ) -> Result<(), SendError> {
        let handle = self
            .by_id
            .get(&connection_id)
            .ok_or(SendError::NotFound(connection_id))?;
        {
            let conn = handle.connection.lock().await;
            if !conn.accepts_outbound() {
                return Err(SendError::NotSendable(connection_id));
            }
        }
        handle
            .outbound
            .send(msg)
            .map_err(|e| SendError::WriteFailed(e.to_string()))
    }

    pub async fn broadcast_to_conversation(&self, conversation_id: &str, msg: ProtocolMessage) {
        let Some(ids) = self.by_conversation.get(conversation_id).map(|v| v.clone()) else {
            return;
        };
        for id in ids {
            if let Err(e) = self.send_to_connection(id, msg.clone()).await {
                tracing::debug!(connection_id = %id, error = %e, "broadcast send failed");
            }
        }
    }

    /// Unregisters a connection on socket close, dropping the last owning
    /// reference to its `Connection` (spec §3 lifecycle).
    pub fn unregister(&self, connection_id: Uuid) {
        if let Some((_, handle)) = self.by_id.remove(&connection_id) {
            if let Ok(conn) = handle.connection.try_lock() {
                if let Some(ids) = self.by_user.get_mut(&conn.user_id).as_deref_mut() {
                    ids.retain(|id| *id != connection_id);
                }
                if let Some(conversation_id) = &conn.conversation_id {
                    if let Some(ids) = self.by_conversation.get_mut(conversation_id).as_deref_mut() {
                        ids.retain(|id| *id != connection_id);
                    }
                }
            }
        }
    }

    /// Spawns the heartbeat task for one connection: sends `system.ping` every
    /// `ping_interval`, force-closing (by returning) once missed pongs exceed
    /// the configured maximum (spec §4.6). The caller (the connection's own
    /// receive task, via `serve`) is responsible for actually closing the
    /// socket with 1011 when this task exits early.
    pub fn spawn_heartbeat(
        self: Arc<Self>,
        connection_id: Uuid,
        ping_interval: Duration,
        max_missed_pongs: u32,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            loop {
                ticker.tick().await;
                let ping = ProtocolMessage::new("system.ping", serde_json::json!({}));
                if self.send_to_connection(connection_id, ping).await.is_err() {
                    return;
                }
                if self.record_missed_pong(connection_id, max_missed_pongs).await {
                    tracing::warn!(connection_id = %connection_id, "heartbeat failure, closing connection");
                    self.unregister(connection_id);
                    return;
                }
            }
        })
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_send_round_trips() {
        let manager = ConnectionManager::new();
        let mut conn = Connection::new("user-1");
        conn.state = ConnectionState::Active;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = manager.register(conn, tx);

        let msg = ProtocolMessage::new("system.ping", serde_json::json!({}));
        manager.send_to_connection(id, msg.clone()).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.message_type, msg.message_type);
    }

    #[tokio::test]
    async fn illegal_transition_is_refused() {
        let manager = ConnectionManager::new();
        let conn = Connection::new("user-1");
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = manager.register(conn, tx);

        assert!(!manager.transition(id, ConnectionState::Active).await);
        assert!(manager.transition(id, ConnectionState::Connected).await);
    }

    #[tokio::test]
    async fn missed_pong_threshold_triggers_close() {
        let manager = ConnectionManager::new();
        let conn = Connection::new("user-1");
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = manager.register(conn, tx);

        assert!(!manager.record_missed_pong(id, 2).await);
        assert!(manager.record_missed_pong(id, 2).await);
    }

    #[tokio::test]
    async fn unregister_removes_from_user_index() {
        let manager = ConnectionManager::new();
        let conn = Connection::new("user-1");
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = manager.register(conn, tx);
        manager.unregister(id);
        assert!(manager.get(id).is_none());
    }
}
