//! `data.*` plane, client→server direction (spec §3, §4.8).

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageSend {
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseSubmit {
    #[serde(rename = "itemId")]
    pub item_id: String,
    #[serde(rename = "widgetId")]
    pub widget_id: String,
    pub value: serde_json::Value,
    /// When true, the orchestrator records the value but defers the
    /// `isComplete` check until the batch's final submission (§4.8 step 4;
    /// the batch terminator itself is an open question, spec §9).
    #[serde(default, rename = "batch")]
    pub batch: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvents {
    pub events: Vec<serde_json::Value>,
}

/// Present in the registry per spec §4.1, but the deployment is client-driven
/// tool execution only in some mode; the core validates the payload shape
/// without assuming a handler is wired up (spec §9 open question).
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
