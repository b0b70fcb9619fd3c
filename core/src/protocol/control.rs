//! `control.*` plane: conversation flow and widget rendering (spec §3, §4.9, §4.12).

use serde::{Deserialize, Serialize};

/// Marker payload for `control.*` messages that carry no fields of their own
/// (`pause`, `cancel`, `resume`, `flow.start`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(rename = "isProactive")]
    pub is_proactive: bool,
    #[serde(rename = "totalItems")]
    pub total_items: u32,
    #[serde(rename = "displayProgressIndicator")]
    pub display_progress_indicator: bool,
    #[serde(rename = "allowNavigation")]
    pub allow_navigation: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemContext {
    #[serde(rename = "itemId")]
    pub item_id: String,
    #[serde(rename = "itemIndex")]
    pub item_index: u32,
    #[serde(rename = "totalItems")]
    pub total_items: u32,
    #[serde(rename = "timeLimitSeconds", skip_serializing_if = "Option::is_none")]
    pub time_limit_seconds: Option<u32>,
}

/// Rendered as `control.widget.render`. `correct_answer` (server-side only)
/// deliberately has no field here — it must never reach this struct (spec
/// §4.12, §8 invariant).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WidgetRender {
    #[serde(rename = "itemId")]
    pub item_id: String,
    #[serde(rename = "widgetId")]
    pub widget_id: String,
    #[serde(rename = "widgetType")]
    pub widget_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
    #[serde(rename = "widgetConfig")]
    pub widget_config: serde_json::Value,
    pub required: bool,
    pub skippable: bool,
    #[serde(rename = "initialValue", skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<serde_json::Value>,
    #[serde(rename = "showUserResponse")]
    pub show_user_response: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WidgetUpdate {
    #[serde(rename = "widgetId")]
    pub widget_id: String,
    pub patch: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowChatInput {
    pub enabled: bool,
}
