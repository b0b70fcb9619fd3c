//! Repository interfaces and DTO projections the orchestrator writes/reads
//! through (C14, spec §3, §6). Not an implementation — the storage engine
//! itself is out of scope (spec §1).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },
    #[error("optimistic concurrency conflict on {entity} {id}: expected version {expected}, found {actual}")]
    VersionConflict {
        entity: String,
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("repository error: {0}")]
    Other(String),
}

/// A stored message in the conversation log (spec §3 `Conversation`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: String,
    pub content: String,
}

/// Per-item persisted responses (spec §3 `Conversation`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemResponseRecord {
    pub item_id: String,
    pub item_index: u32,
    pub responses: serde_json::Value,
    pub response_time_ms: u64,
    pub is_correct: Option<bool>,
    pub score: Option<f64>,
}

/// The `Conversation` aggregate DTO (spec §3), versioned for optimistic
/// concurrency (spec §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub owner_user_id: String,
    pub definition_id: Option<String>,
    pub template_id: Option<String>,
    pub messages: Vec<ConversationMessage>,
    pub current_item_index: u32,
    pub item_responses: Vec<ItemResponseRecord>,
    pub version: u64,
}

/// Generic CRUD-plus-optimistic-concurrency abstraction (spec §6).
#[async_trait]
pub trait Repository<T>: Send + Sync
where
    T: Send + Sync,
{
    async fn get(&self, id: &str) -> Result<T, RepositoryError>;
    /// Rejects with [`RepositoryError::VersionConflict`] if `entity`'s version
    /// does not match the stored version (spec §6 "Update must enforce
    /// optimistic concurrency on a numeric `version`").
    async fn update(&self, entity: T) -> Result<T, RepositoryError>;
    async fn remove(&self, id: &str) -> Result<(), RepositoryError>;
    async fn query_by_owner(&self, user_id: &str) -> Result<Vec<T>, RepositoryError>;
    async fn query_by_definition(&self, definition_id: &str) -> Result<Vec<T>, RepositoryError>;
}

pub type ConversationRepository = dyn Repository<ConversationRecord>;

/// Read-only lookup for the template/definition projections the orchestrator
/// needs to drive a run, distinct from [`Repository`] since neither supports
/// versioned updates from `core`'s side (spec §3).
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn get_template(&self, id: &str) -> Result<ConversationTemplateRecord, RepositoryError>;
    async fn get_definition(&self, id: &str) -> Result<AgentDefinitionRecord, RepositoryError>;
}

/// An `AgentDefinition` projection (spec §3), read-only from the core's
/// perspective.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentDefinitionRecord {
    pub id: String,
    pub display_name: String,
    pub system_prompt: String,
    pub tool_allow_list: Vec<String>,
    pub model_override: Option<String>,
    pub conversation_template_id: Option<String>,
}

/// A `ConversationTemplate` projection (spec §3), read-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationTemplateRecord {
    pub id: String,
    pub agent_starts_first: bool,
    pub allow_navigation: bool,
    pub allow_backward_navigation: bool,
    pub enable_chat_input_initially: bool,
    pub display_progress_indicator: bool,
    pub display_final_score_report: bool,
    pub shuffle_items: bool,
    pub continue_after_completion: bool,
    pub items: Vec<TemplateItemRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateItemRecord {
    pub id: String,
    pub contents: Vec<ItemContentRecord>,
    pub enable_chat_input: bool,
    pub time_limit_seconds: Option<u32>,
    pub require_user_confirmation: bool,
    pub confirmation_button_text: String,
    pub provide_feedback: bool,
    pub reveal_correct_answer: bool,
    pub include_conversation_context: bool,
}

/// `ItemContent` (spec §3). `correct_answer` lives here but must never cross
/// into a [`crate::protocol::control::WidgetRender`] (spec §8 invariant).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemContentRecord {
    pub id: String,
    pub widget_type: String,
    pub is_templated: bool,
    pub source_id: Option<String>,
    pub widget_config: serde_json::Value,
    pub stem: Option<String>,
    pub options: Option<serde_json::Value>,
    pub required: bool,
    pub skippable: bool,
    pub initial_value: Option<serde_json::Value>,
    pub correct_answer: Option<serde_json::Value>,
    pub show_user_response: bool,
    pub instructions: Option<String>,
}
