//! The orchestrator's in-memory per-connection state: `ConversationContext` and
//! `ItemExecutionState` (C8, spec §3).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

/// The orchestrator state machine (spec §4.8), distinct from the connection
/// state machine in [`crate::connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorState {
    Initializing,
    Ready,
    Presenting,
    Processing,
    Suspended,
    Paused,
    Completed,
    Error,
}

impl OrchestratorState {
    /// Legal transitions per spec §4.8.
    pub fn can_transition_to(self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;
        if next == self {
            return false;
        }
        let allowed: &[OrchestratorState] = match self {
            Initializing => &[Ready, Presenting, Error],
            Ready => &[Processing, Paused, Completed, Error],
            Presenting => &[Suspended, Ready, Paused, Completed, Error],
            Processing => &[Ready, Suspended, Paused, Completed, Error],
            Suspended => &[Presenting, Ready, Paused, Completed, Error],
            Paused => &[Ready, Presenting, Completed, Error],
            Completed | Error => &[],
        };
        allowed.contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrchestratorState::Completed | OrchestratorState::Error)
    }

    /// `{READY, PROCESSING}` accept `data.message.send`; `{SUSPENDED}` accepts
    /// `data.response.submit` (spec §4.8).
    pub fn accepts_message_send(self) -> bool {
        matches!(self, OrchestratorState::Ready | OrchestratorState::Processing)
    }

    pub fn accepts_response_submit(self) -> bool {
        matches!(self, OrchestratorState::Suspended)
    }
}

/// The flow flags from the bound `ConversationTemplate` the orchestrator
/// actually needs at runtime (spec §3 `templateConfig`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub agent_starts_first: bool,
    pub allow_navigation: bool,
    pub allow_backward_navigation: bool,
    pub enable_chat_input_initially: bool,
    pub display_progress_indicator: bool,
    pub display_final_score_report: bool,
    pub shuffle_items: bool,
    pub continue_after_completion: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoringResult {
    pub is_correct: bool,
    pub score: f64,
    pub max_score: f64,
    pub feedback: Option<String>,
}

/// Lifecycle per template item (spec §3). Created on item entry, destroyed on
/// item completion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemExecutionState {
    pub item_id: String,
    pub item_index: u32,
    pub required_widget_ids: BTreeSet<String>,
    pub answered_widget_ids: BTreeSet<String>,
    pub widget_responses: std::collections::HashMap<String, serde_json::Value>,
    pub widget_configs: std::collections::HashMap<String, serde_json::Value>,
    pub require_user_confirmation: bool,
    pub user_confirmed: bool,
    #[serde(skip, default = "Instant::now")]
    pub started_at: Instant,
    #[serde(skip)]
    pub completed_at: Option<Instant>,
    pub scoring_result: Option<ScoringResult>,
    /// Set by the template runner at render time when `provideFeedback` is on;
    /// carries the reference content the widget handler scores against (spec
    /// §4.9 step 6).
    #[serde(skip)]
    pub scoring_content: Option<crate::repository::ItemContentRecord>,
}

impl ItemExecutionState {
    pub fn new(item_id: impl Into<String>, item_index: u32, required_widget_ids: BTreeSet<String>, require_user_confirmation: bool) -> Self {
        Self {
            item_id: item_id.into(),
            item_index,
            required_widget_ids,
            answered_widget_ids: BTreeSet::new(),
            widget_responses: std::collections::HashMap::new(),
            widget_configs: std::collections::HashMap::new(),
            require_user_confirmation,
            user_confirmed: false,
            started_at: Instant::now(),
            completed_at: None,
            scoring_result: None,
            scoring_content: None,
        }
    }

    /// `requiredWidgetIds ⊆ answeredWidgetIds` AND (`requireUserConfirmation ⇒ userConfirmed`)
    /// (spec §3 invariant, §8 for-all property).
    pub fn is_complete(&self) -> bool {
        self.required_widget_ids.is_subset(&self.answered_widget_ids)
            && (!self.require_user_confirmation || self.user_confirmed)
    }

    /// Records a widget response. Idempotent: resubmitting the same
    /// `(widgetId, value)` is a no-op with respect to completion/scoring
    /// (spec §8 round-trip property).
    pub fn record_response(&mut self, widget_id: &str, value: serde_json::Value) -> bool {
        let unchanged = self.widget_responses.get(widget_id) == Some(&value);
        if unchanged {
            return false;
        }
        self.widget_responses.insert(widget_id.to_string(), value);
        if self.required_widget_ids.contains(widget_id) {
            self.answered_widget_ids.insert(widget_id.to_string());
        }
        true
    }
}

/// Per-connection orchestrator state (spec §3). Owned exclusively by the
/// connection's receive task; the template runner reads/writes it only
/// through messages routed back via the widget handler (spec §9).
#[derive(Clone, Debug)]
pub struct ConversationContext {
    pub connection_id: Uuid,
    pub conversation_id: String,
    pub state: OrchestratorState,
    pub is_proactive: bool,
    pub has_template: bool,
    pub current_item_index: u32,
    pub total_items: u32,
    pub current_item_state: Option<ItemExecutionState>,
    pub template_config: TemplateConfig,
    pub pending_widget_id: Option<String>,
    pub pending_tool_call_id: Option<String>,
    pub last_activity: Instant,
    pub model: Option<String>,
    pub definition_name: Option<String>,
    pub template_id: Option<String>,
    /// Signaled by the widget handler once an item's `isComplete` check
    /// passes and its persistence/advance commands finish; the template
    /// runner's background task awaits this between items (spec §4.9 step 5,
    /// §4.8 widget handler step 5e).
    pub item_complete: Arc<Notify>,
}

impl ConversationContext {
    pub fn new(connection_id: Uuid, conversation_id: impl Into<String>, is_proactive: bool, has_template: bool) -> Self {
        Self {
            connection_id,
            conversation_id: conversation_id.into(),
            state: OrchestratorState::Initializing,
            is_proactive,
            has_template,
            current_item_index: 0,
            total_items: 0,
            current_item_state: None,
            template_config: TemplateConfig::default(),
            pending_widget_id: None,
            pending_tool_call_id: None,
            last_activity: Instant::now(),
            model: None,
            definition_name: None,
            template_id: None,
            item_complete: Arc::new(Notify::new()),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Applies a state transition, refusing (and leaving state unchanged on)
    /// an illegal one (spec §4.8, §8 for-all property).
    pub fn transition(&mut self, next: OrchestratorState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                from = ?self.state,
                to = ?next,
                "illegal orchestrator state transition refused"
            );
            false
        }
    }
}
