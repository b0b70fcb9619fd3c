//! The three cooperating handlers that drive one conversation — message,
//! widget, and flow (C9, spec §4.8). All three share a single
//! [`ConversationContext`] guarded by a per-connection mutex.

mod audit_handler;
mod flow_handler;
mod message_handler;
mod widget_handler;

pub use audit_handler::AuditHandler;
pub use flow_handler::FlowHandler;
pub use message_handler::MessageHandler;
pub use widget_handler::WidgetHandler;

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::agent::AgentSettings;
use crate::context::ConversationContext;
use crate::llm::LlmClient;
use crate::mediator::Mediator;
use crate::repository::{ConversationRepository, TemplateSource};
use crate::senders::ProtocolSender;
use crate::tool_exec::ToolExecutor;

/// `ConversationContext` is mutated by whichever handler is currently
/// dispatching for this connection; the router only ever holds an immutable
/// reference, so interior mutability lives here rather than on the struct
/// itself (spec §9).
pub type SharedContext = Arc<Mutex<ConversationContext>>;

/// The singletons every orchestrator handler needs, bundled so the three
/// `Handler` impls don't each carry a long constructor (spec §5, §9).
pub struct OrchestratorDeps {
    pub mediator: Arc<Mediator>,
    pub sender: Arc<ProtocolSender>,
    pub llm: Arc<dyn LlmClient>,
    pub tool_executor: Arc<dyn ToolExecutor>,
    pub template_source: Arc<dyn TemplateSource>,
    pub conversations: Arc<ConversationRepository>,
    pub agent_settings: AgentSettings,
}
