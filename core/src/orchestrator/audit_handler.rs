//! `data.audit.events` / `data.tool.result` (spec §4.1 registry, §4.8).
//!
//! Neither carries orchestrator state changes in this deployment: audit
//! events are client-side telemetry the server only needs to acknowledge by
//! accepting the frame, and tool results arrive here only when tool execution
//! is client-driven rather than routed through [`crate::tool_exec`] (spec §9
//! open question). Registering a handler — even one that just logs — lets
//! the rate-limit middleware actually engage for these two types instead of
//! the router short-circuiting to `UNKNOWN_MESSAGE_TYPE` first.

use async_trait::async_trait;

use crate::connection::Connection;
use crate::protocol::InboundMessage;
use crate::router::{Handler, RouterError};

pub struct AuditHandler;

#[async_trait]
impl<Ctx: Send + Sync> Handler<Ctx> for AuditHandler {
    async fn handle(&self, connection: &Connection, _ctx: &Ctx, message: InboundMessage) -> Result<(), RouterError> {
        match message {
            InboundMessage::DataAuditEvents(events) => {
                tracing::debug!(user_id = %connection.user_id, count = events.events.len(), "received client audit events");
                Ok(())
            }
            InboundMessage::DataToolResult(result) => {
                tracing::debug!(user_id = %connection.user_id, call_id = %result.call_id, success = result.success, "received client-driven tool result");
                Ok(())
            }
            other => Err(RouterError::InvalidPayload(other.type_name().to_string())),
        }
    }
}
