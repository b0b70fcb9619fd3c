//! The wire protocol: envelope shape, closed type registry, and close codes
//! (spec §3, §4.1).
//!
//! The registry is partitioned into four planes, each a submodule holding the
//! payload structs for that plane's message types:
//!
//! - [`system`]: connection-lifecycle messages (`system.*`).
//! - [`control`]: conversation-flow and widget-render messages (`control.*`).
//! - [`data_in`]: client→server data messages (`data.*` inbound).
//! - [`data_out`]: server→client data messages (`data.*` outbound).
//!
//! Dynamic dispatch over the dotted `type` string is kept flat and mechanical: a
//! tagged enum per direction rather than a class hierarchy, so (de)serialization
//! is a single `serde` derive.

pub mod control;
pub mod data_in;
pub mod data_out;
pub mod system;

use serde::{Deserialize, Serialize};

/// The on-wire envelope (spec §3). `payload` is left as a raw JSON value here;
/// the router parses it into a typed [`InboundMessage`] once the `type` has been
/// checked against the registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
    #[serde(default, rename = "conversationId", skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub timestamp: i64,
}

impl ProtocolMessage {
    pub fn new(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            conversation_id: None,
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// WebSocket close codes used by the connection manager (spec §4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    AuthFailure,
    InternalError,
    Restart,
    App(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::AuthFailure => 1008,
            CloseCode::InternalError => 1011,
            CloseCode::Restart => 1012,
            CloseCode::App(code) => code,
        }
    }
}

/// Every inbound message type the router will dispatch, parsed from the
/// envelope's `payload` once `type` has matched one of these variants. Any
/// `type` not matching a variant here is `UNKNOWN_MESSAGE_TYPE`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundMessage {
    #[serde(rename = "system.ping")]
    SystemPing(system::Ping),
    #[serde(rename = "system.pong")]
    SystemPong(system::Pong),
    #[serde(rename = "system.connection.resume")]
    SystemConnectionResume(system::ConnectionResume),
    #[serde(rename = "control.conversation.pause")]
    ControlConversationPause(control::Empty),
    #[serde(rename = "control.conversation.cancel")]
    ControlConversationCancel(control::Empty),
    #[serde(rename = "control.conversation.resume")]
    ControlConversationResume(control::Empty),
    #[serde(rename = "control.flow.pause")]
    ControlFlowPause(control::Empty),
    #[serde(rename = "control.flow.resume")]
    ControlFlowResume(control::Empty),
    #[serde(rename = "control.flow.start")]
    ControlFlowStart(control::Empty),
    #[serde(rename = "data.message.send")]
    DataMessageSend(data_in::MessageSend),
    #[serde(rename = "data.response.submit")]
    DataResponseSubmit(data_in::ResponseSubmit),
    #[serde(rename = "data.audit.events")]
    DataAuditEvents(data_in::AuditEvents),
    #[serde(rename = "data.tool.result")]
    DataToolResult(data_in::ToolResult),
}

impl InboundMessage {
    /// Parses a raw envelope into a typed message, given the registry has
    /// already confirmed `message_type` is known. Returns `None` on a schema
    /// mismatch (caller reports `INVALID_PAYLOAD`).
    pub fn from_envelope(msg: &ProtocolMessage) -> Option<Self> {
        let tagged = serde_json::json!({
            "type": msg.message_type,
            "payload": msg.payload,
        });
        serde_json::from_value(tagged).ok()
    }

    /// The dotted type string for this variant, matching what was on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            InboundMessage::SystemPing(_) => "system.ping",
            InboundMessage::SystemPong(_) => "system.pong",
            InboundMessage::SystemConnectionResume(_) => "system.connection.resume",
            InboundMessage::ControlConversationPause(_) => "control.conversation.pause",
            InboundMessage::ControlConversationCancel(_) => "control.conversation.cancel",
            InboundMessage::ControlConversationResume(_) => "control.conversation.resume",
            InboundMessage::ControlFlowPause(_) => "control.flow.pause",
            InboundMessage::ControlFlowResume(_) => "control.flow.resume",
            InboundMessage::ControlFlowStart(_) => "control.flow.start",
            InboundMessage::DataMessageSend(_) => "data.message.send",
            InboundMessage::DataResponseSubmit(_) => "data.response.submit",
            InboundMessage::DataAuditEvents(_) => "data.audit.events",
            InboundMessage::DataToolResult(_) => "data.tool.result",
        }
    }
}

/// Returns `true` if `message_type` is a member of the closed registry, in
/// either direction. Used by the router to distinguish `UNKNOWN_MESSAGE_TYPE`
/// from a known type with a bad payload.
pub fn is_registered_type(message_type: &str) -> bool {
    const KNOWN: &[&str] = &[
        "system.ping",
        "system.pong",
        "system.error",
        "system.connection.resume",
        "system.connection.resumed",
        "control.conversation.config",
        "control.conversation.pause",
        "control.conversation.cancel",
        "control.conversation.resume",
        "control.item.context",
        "control.widget.render",
        "control.widget.update",
        "control.flow.start",
        "control.flow.chatInput",
        "control.flow.pause",
        "control.flow.resume",
        "data.message.send",
        "data.response.submit",
        "data.audit.events",
        "data.tool.result",
        "data.message.ack",
        "data.content.chunk",
        "data.content.complete",
        "data.tool.call",
        "data.response.ack",
    ];
    KNOWN.contains(&message_type)
}
