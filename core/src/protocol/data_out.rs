//! `data.*` plane, server→client direction (spec §4.12).

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageAck {
    #[serde(rename = "messageId")]
    pub message_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentChunk {
    pub content: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub r#final: bool,
}

/// `role` is one of `"assistant" | "system" | "user"` (spec §4.12).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentComplete {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub role: String,
    #[serde(rename = "fullContent")]
    pub full_content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(rename = "callId")]
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(rename = "callId")]
    pub call_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseAck {
    #[serde(rename = "itemId")]
    pub item_id: String,
    #[serde(rename = "widgetId")]
    pub widget_id: String,
}
