//! `system.ping` / `system.pong` / `system.connection.resume` (spec §4.6).
//!
//! These are connection-scoped rather than orchestrator-scoped: they never
//! touch `ConversationContext`, only the `Connection` the manager owns, plus
//! (for resume) a read of the stored conversation.

use std::sync::Arc;

use async_trait::async_trait;

use super::ConnectionManager;
use crate::protocol::system::ConnectionResumed;
use crate::protocol::InboundMessage;
use crate::repository::{ConversationRepository, RepositoryError};
use crate::router::{Handler, RouterError};

pub struct SystemHandler<Ctx: Send + Sync> {
    manager: Arc<ConnectionManager>,
    conversations: Arc<ConversationRepository>,
    _ctx: std::marker::PhantomData<Ctx>,
}

impl<Ctx: Send + Sync> SystemHandler<Ctx> {
    pub fn new(manager: Arc<ConnectionManager>, conversations: Arc<ConversationRepository>) -> Self {
        Self {
            manager,
            conversations,
            _ctx: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<Ctx: Send + Sync> Handler<Ctx> for SystemHandler<Ctx> {
    async fn handle(&self, connection: &crate::connection::Connection, _ctx: &Ctx, message: InboundMessage) -> Result<(), RouterError> {
        let connection_id = connection.connection_id;
        match message {
            InboundMessage::SystemPong(_) => {
                self.manager.record_pong(connection_id).await;
                Ok(())
            }
            InboundMessage::SystemPing(_) => {
                self.manager
                    .send_to_connection(connection_id, crate::protocol::ProtocolMessage::new("system.pong", serde_json::json!({})))
                    .await
                    .ok();
                Ok(())
            }
            InboundMessage::SystemConnectionResume(resume) => {
                let (state_valid, current_item_index) = match self.conversations.get(&resume.conversation_id).await {
                    Ok(conversation) if conversation.owner_user_id == connection.user_id => (true, conversation.current_item_index),
                    Ok(_) => (false, 0),
                    Err(RepositoryError::NotFound { .. }) => (false, 0),
                    Err(e) => {
                        tracing::warn!(conversation_id = %resume.conversation_id, error = %e, "resume lookup failed");
                        (false, 0)
                    }
                };
                let payload = ConnectionResumed {
                    state_valid,
                    current_item_index,
                    // First-phase: no replay, client reconciles idempotently (spec §4.6).
                    missed_messages: 0,
                };
                self.manager
                    .send_to_connection(
                        connection_id,
                        crate::protocol::ProtocolMessage::new("system.connection.resumed", serde_json::to_value(payload).unwrap_or_default())
                            .with_conversation(&resume.conversation_id),
                    )
                    .await
                    .ok();
                Ok(())
            }
            other => Err(RouterError::InvalidPayload(other.type_name().to_string())),
        }
    }
}
