//! Formats and emits server→client protocol messages (C13, spec §4.12).
//!
//! Dynamic parameters are modeled as explicit option structs rather than
//! loose positional arguments (spec §9 design note).

use std::sync::Arc;
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::protocol::{control, data_out, system, ProtocolMessage};

/// Options for [`ProtocolSender::stream_content`].
pub struct StreamContentOptions {
    pub message_id: String,
    pub role: String,
    /// Characters per `data.content.chunk` (default 50, spec §4.12).
    pub chunk_size: usize,
    /// Optional delay between chunks; zero for real LLM streams that don't
    /// need client-side pacing simulation (spec §4.12).
    pub chunk_delay: std::time::Duration,
}

impl StreamContentOptions {
    pub fn new(message_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            role: role.into(),
            chunk_size: 50,
            chunk_delay: std::time::Duration::ZERO,
        }
    }
}

/// Wraps a [`ConnectionManager`] to format and emit the server→client wire
/// messages. Sends for one connection preserve emit order because the
/// manager's outbound channel is an `mpsc` (spec §5).
pub struct ProtocolSender {
    manager: Arc<ConnectionManager>,
}

impl ProtocolSender {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Emits a raw frame under any registered type — used by callers
    /// acknowledging a `control.*` action with a bare `{acknowledged, timestamp}`
    /// body where no dedicated response struct exists (spec §4.8 flow handler
    /// pause/cancel/resume acks).
    pub async fn raw(&self, connection_id: Uuid, message_type: &str, payload: serde_json::Value) {
        self.send(connection_id, message_type, payload, None).await;
    }

    async fn send(&self, connection_id: Uuid, message_type: &str, payload: serde_json::Value, conversation_id: Option<&str>) {
        let mut msg = ProtocolMessage::new(message_type, payload);
        if let Some(cid) = conversation_id {
            msg = msg.with_conversation(cid);
        }
        if let Err(e) = self.manager.send_to_connection(connection_id, msg).await {
            tracing::debug!(connection_id = %connection_id, error = %e, "sender: send failed");
        }
    }

    /// One `data.content.chunk` frame. Used both by [`Self::stream_content`]'s
    /// internal chunking and directly by callers relaying already-chunked
    /// events (e.g. the agent loop's `LLM_RESPONSE_CHUNK`, spec §4.10).
    pub async fn content_chunk(&self, connection_id: Uuid, message_id: &str, content: &str, is_final: bool) {
        let chunk = data_out::ContentChunk {
            content: content.to_string(),
            message_id: message_id.to_string(),
            r#final: is_final,
        };
        self.send(connection_id, "data.content.chunk", serde_json::to_value(chunk).unwrap_or_default(), None)
            .await;
    }

    pub async fn content_complete(&self, connection_id: Uuid, message_id: &str, role: &str, full_content: &str) {
        let complete = data_out::ContentComplete {
            message_id: message_id.to_string(),
            role: role.to_string(),
            full_content: full_content.to_string(),
        };
        self.send(
            connection_id,
            "data.content.complete",
            serde_json::to_value(complete).unwrap_or_default(),
            None,
        )
        .await;
    }

    /// Chunks `full_text` by `options.chunk_size` into `data.content.chunk`
    /// frames with `final=true` on the last, followed by
    /// `data.content.complete` (spec §4.12). Used by the template runner for
    /// static text content, which has no live stream to relay.
    pub async fn stream_content(&self, connection_id: Uuid, full_text: &str, options: StreamContentOptions) {
        let chars: Vec<char> = full_text.chars().collect();
        let mut pieces: Vec<String> = chars
            .chunks(options.chunk_size.max(1))
            .map(|c| c.iter().collect())
            .collect();
        if pieces.is_empty() {
            pieces.push(String::new());
        }
        let last = pieces.len() - 1;

        for (index, piece) in pieces.into_iter().enumerate() {
            self.content_chunk(connection_id, &options.message_id, &piece, index == last).await;
            if !options.chunk_delay.is_zero() {
                tokio::time::sleep(options.chunk_delay).await;
            }
        }

        self.content_complete(connection_id, &options.message_id, &options.role, full_text).await;
    }

    pub async fn message_ack(&self, connection_id: Uuid, message_id: &str) {
        let ack = data_out::MessageAck {
            message_id: message_id.to_string(),
        };
        self.send(connection_id, "data.message.ack", serde_json::to_value(ack).unwrap_or_default(), None)
            .await;
    }

    pub async fn response_ack(&self, connection_id: Uuid, item_id: &str, widget_id: &str) {
        let ack = data_out::ResponseAck {
            item_id: item_id.to_string(),
            widget_id: widget_id.to_string(),
        };
        self.send(connection_id, "data.response.ack", serde_json::to_value(ack).unwrap_or_default(), None)
            .await;
    }

    /// Never includes `correctAnswer` — it has no field in [`control::WidgetRender`]
    /// (spec §4.12, §8 invariant).
    pub async fn widget_render(&self, connection_id: Uuid, render: control::WidgetRender) {
        self.send(connection_id, "control.widget.render", serde_json::to_value(render).unwrap_or_default(), None)
            .await;
    }

    pub async fn item_context(&self, connection_id: Uuid, context: control::ItemContext) {
        self.send(connection_id, "control.item.context", serde_json::to_value(context).unwrap_or_default(), None)
            .await;
    }

    pub async fn flow_chat_input(&self, connection_id: Uuid, enabled: bool) {
        let payload = control::FlowChatInput { enabled };
        self.send(connection_id, "control.flow.chatInput", serde_json::to_value(payload).unwrap_or_default(), None)
            .await;
    }

    pub async fn tool_call(&self, connection_id: Uuid, call: data_out::ToolCall) {
        self.send(connection_id, "data.tool.call", serde_json::to_value(call).unwrap_or_default(), None)
            .await;
    }

    pub async fn tool_result(&self, connection_id: Uuid, result: data_out::ToolResult) {
        self.send(connection_id, "data.tool.result", serde_json::to_value(result).unwrap_or_default(), None)
            .await;
    }

    pub async fn conversation_config(&self, connection_id: Uuid, config: control::ConversationConfig) {
        self.send(
            connection_id,
            "control.conversation.config",
            serde_json::to_value(config).unwrap_or_default(),
            None,
        )
        .await;
    }

    pub async fn error(&self, connection_id: Uuid, error: system::SystemError) {
        self.send(connection_id, "system.error", serde_json::to_value(error).unwrap_or_default(), None)
            .await;
    }
}
