//! `control.flow.*` and `control.conversation.*` (spec §4.8).

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::{OrchestratorDeps, SharedContext};
use crate::connection::Connection;
use crate::context::OrchestratorState;
use crate::protocol::InboundMessage;
use crate::router::{Handler, RouterError};
use crate::template::{PlaceholderContext, TemplateRunner};

pub struct FlowHandler {
    deps: Arc<OrchestratorDeps>,
}

impl FlowHandler {
    pub fn new(deps: Arc<OrchestratorDeps>) -> Self {
        Self { deps }
    }

    async fn start(&self, connection_id: Uuid, connection: &Connection, ctx: &SharedContext) -> Result<(), RouterError> {
        let (in_ready, is_proactive, has_template, template_id) = {
            let guard = ctx.lock().await;
            (
                guard.state == OrchestratorState::Ready,
                guard.is_proactive,
                guard.has_template,
                guard.template_id.clone(),
            )
        };

        if !in_ready {
            return Err(RouterError::InvalidState("control.flow.start".to_string()));
        }

        if is_proactive && has_template {
            let Some(template_id) = template_id else {
                return Err(RouterError::HandlerError("proactive conversation has no bound template".to_string()));
            };
            {
                let mut guard = ctx.lock().await;
                guard.transition(OrchestratorState::Presenting);
            }
            let deps = self.deps.clone();
            let ctx = ctx.clone();
            let user_id = connection.user_id.clone();
            let agent_name = connection.definition_id.clone().unwrap_or_default();
            tokio::spawn(run_template(deps, ctx, connection_id, template_id, user_id, agent_name));
        } else {
            self.deps.sender.flow_chat_input(connection_id, true).await;
        }
        Ok(())
    }

    async fn pause(&self, connection_id: Uuid, ctx: &SharedContext) -> Result<(), RouterError> {
        let mut guard = ctx.lock().await;
        guard.transition(OrchestratorState::Paused);
        drop(guard);
        self.deps
            .sender
            .raw(
                connection_id,
                "control.conversation.pause",
                serde_json::json!({"acknowledged": true, "timestamp": chrono::Utc::now().timestamp_millis()}),
            )
            .await;
        Ok(())
    }

    async fn cancel(&self, connection_id: Uuid, ctx: &SharedContext) -> Result<(), RouterError> {
        let mut guard = ctx.lock().await;
        guard.pending_widget_id = None;
        guard.pending_tool_call_id = None;
        guard.transition(OrchestratorState::Ready);
        drop(guard);
        self.deps
            .sender
            .raw(
                connection_id,
                "control.conversation.cancel",
                serde_json::json!({"acknowledged": true, "timestamp": chrono::Utc::now().timestamp_millis()}),
            )
            .await;
        Ok(())
    }

    /// Allowed only from `PAUSED`; routes as `start` for the current mode
    /// (spec §4.8 flow handler `resume`).
    async fn resume(&self, connection_id: Uuid, connection: &Connection, ctx: &SharedContext) -> Result<(), RouterError> {
        let was_paused = {
            let mut guard = ctx.lock().await;
            if guard.state != OrchestratorState::Paused {
                return Err(RouterError::InvalidState("control.flow.resume".to_string()));
            }
            guard.transition(OrchestratorState::Ready);
            true
        };
        if was_paused {
            self.start(connection_id, connection, ctx).await
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Handler<SharedContext> for FlowHandler {
    async fn handle(&self, connection: &Connection, ctx: &SharedContext, message: InboundMessage) -> Result<(), RouterError> {
        let connection_id = connection.connection_id;
        match message {
            InboundMessage::ControlFlowStart(_) => self.start(connection_id, connection, ctx).await,
            InboundMessage::ControlFlowPause(_) | InboundMessage::ControlConversationPause(_) => self.pause(connection_id, ctx).await,
            InboundMessage::ControlFlowResume(_) => self.resume(connection_id, connection, ctx).await,
            InboundMessage::ControlConversationResume(_) => self.resume(connection_id, connection, ctx).await,
            InboundMessage::ControlConversationCancel(_) => self.cancel(connection_id, ctx).await,
            other => Err(RouterError::InvalidPayload(other.type_name().to_string())),
        }
    }
}

/// Background task spawned by `start`: walks the template's items in order
/// (shuffled if requested), rendering each and waiting on `item_complete`
/// before moving to the next (spec §4.9).
async fn run_template(
    deps: Arc<OrchestratorDeps>,
    ctx: SharedContext,
    connection_id: Uuid,
    template_id: String,
    user_id: String,
    agent_name: String,
) {
    let template = match deps.template_source.get_template(&template_id).await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(template_id, error = %e, "failed to load conversation template");
            emit_item_load_failed(&deps, connection_id).await;
            return;
        }
    };

    {
        let mut guard = ctx.lock().await;
        guard.total_items = template.items.len() as u32;
        guard.template_config.agent_starts_first = template.agent_starts_first;
        guard.template_config.allow_navigation = template.allow_navigation;
        guard.template_config.allow_backward_navigation = template.allow_backward_navigation;
        guard.template_config.enable_chat_input_initially = template.enable_chat_input_initially;
        guard.template_config.display_progress_indicator = template.display_progress_indicator;
        guard.template_config.display_final_score_report = template.display_final_score_report;
        guard.template_config.shuffle_items = template.shuffle_items;
        guard.template_config.continue_after_completion = template.continue_after_completion;
    }

    let mut order: Vec<usize> = (0..template.items.len()).collect();
    if template.shuffle_items {
        // Deterministic-enough shuffle without a fresh RNG dependency: rotate
        // by the connection id's low byte. Real randomness belongs in `serve`.
        let offset = connection_id.as_bytes()[0] as usize % order.len().max(1);
        order.rotate_left(offset);
    }

    let conversation_id = ctx.lock().await.conversation_id.clone();
    let runner = TemplateRunner::new(deps.llm.clone(), deps.sender.clone());

    for (position, &item_index) in order.iter().enumerate() {
        let item = &template.items[item_index];
        let placeholders = PlaceholderContext {
            user_id: user_id.clone(),
            conversation_id: conversation_id.clone(),
            agent_name: agent_name.clone(),
            current_item: position as u32 + 1,
            total_items: template.items.len() as u32,
        };

        let state = match runner.render_item(connection_id, &placeholders, item, item_index as u32, template.items.len() as u32).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(item_id = %item.id, error = %e, "templated item render failed");
                emit_item_load_failed(&deps, connection_id).await;
                return;
            }
        };

        let notify = {
            let mut guard = ctx.lock().await;
            guard.current_item_index = position as u32;
            guard.current_item_state = Some(state);
            guard.transition(OrchestratorState::Suspended);
            guard.item_complete.clone()
        };

        match item.time_limit_seconds {
            Some(seconds) => {
                if tokio::time::timeout(std::time::Duration::from_secs(seconds as u64), notify.notified())
                    .await
                    .is_err()
                {
                    tracing::info!(item_id = %item.id, seconds, "item time limit elapsed, advancing without a response");
                }
            }
            None => notify.notified().await,
        }

        if ctx.lock().await.state.is_terminal() {
            return;
        }
    }

    let mut guard = ctx.lock().await;
    guard.transition(OrchestratorState::Completed);
    drop(guard);

    deps.sender
        .raw(
            connection_id,
            "data.content.complete",
            serde_json::json!({"messageId": Uuid::new_v4().to_string(), "role": "system", "fullContent": "Conversation complete."}),
        )
        .await;
}

async fn emit_item_load_failed(deps: &OrchestratorDeps, connection_id: Uuid) {
    use crate::protocol::system::{ErrorCategory, ErrorCode, SystemError};
    deps.sender
        .error(
            connection_id,
            SystemError::new(ErrorCategory::Business, ErrorCode::ItemLoadFailed, "failed to load the next templated item", true),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionManager, ConnectionState};
    use crate::context::ConversationContext;
    use crate::llm::MockLlm;
    use crate::mediator::Mediator;
    use crate::repository::{AgentDefinitionRecord, ConversationTemplateRecord, ItemContentRecord, RepositoryError, TemplateItemRecord};
    use crate::tool_exec::MockToolExecutor;
    use tokio::sync::Mutex;

    struct OneItemTemplateSource;
    #[async_trait]
    impl crate::repository::TemplateSource for OneItemTemplateSource {
        async fn get_template(&self, id: &str) -> Result<ConversationTemplateRecord, RepositoryError> {
            Ok(ConversationTemplateRecord {
                id: id.to_string(),
                agent_starts_first: false,
                allow_navigation: false,
                allow_backward_navigation: false,
                enable_chat_input_initially: false,
                display_progress_indicator: true,
                display_final_score_report: false,
                shuffle_items: false,
                continue_after_completion: false,
                items: vec![TemplateItemRecord {
                    id: "item-1".into(),
                    contents: vec![ItemContentRecord {
                        id: "w1".into(),
                        widget_type: "short_answer".into(),
                        is_templated: false,
                        source_id: None,
                        widget_config: serde_json::Value::Null,
                        stem: Some("2+2?".into()),
                        options: None,
                        required: true,
                        skippable: false,
                        initial_value: None,
                        correct_answer: None,
                        show_user_response: true,
                        instructions: None,
                    }],
                    enable_chat_input: false,
                    time_limit_seconds: None,
                    require_user_confirmation: false,
                    confirmation_button_text: "Confirm".into(),
                    provide_feedback: false,
                    reveal_correct_answer: false,
                    include_conversation_context: false,
                }],
            })
        }
        async fn get_definition(&self, id: &str) -> Result<AgentDefinitionRecord, RepositoryError> {
            Err(RepositoryError::NotFound {
                entity: "definition".into(),
                id: id.to_string(),
            })
        }
    }

    struct TimeLimitedTemplateSource;
    #[async_trait]
    impl crate::repository::TemplateSource for TimeLimitedTemplateSource {
        async fn get_template(&self, id: &str) -> Result<ConversationTemplateRecord, RepositoryError> {
            Ok(ConversationTemplateRecord {
                id: id.to_string(),
                agent_starts_first: false,
                allow_navigation: false,
                allow_backward_navigation: false,
                enable_chat_input_initially: false,
                display_progress_indicator: true,
                display_final_score_report: false,
                shuffle_items: false,
                continue_after_completion: false,
                items: vec![TemplateItemRecord {
                    id: "timed-item".into(),
                    contents: vec![ItemContentRecord {
                        id: "w1".into(),
                        widget_type: "short_answer".into(),
                        is_templated: false,
                        source_id: None,
                        widget_config: serde_json::Value::Null,
                        stem: Some("quick, answer!".into()),
                        options: None,
                        required: true,
                        skippable: false,
                        initial_value: None,
                        correct_answer: None,
                        show_user_response: true,
                        instructions: None,
                    }],
                    enable_chat_input: false,
                    time_limit_seconds: Some(1),
                    require_user_confirmation: false,
                    confirmation_button_text: "Confirm".into(),
                    provide_feedback: false,
                    reveal_correct_answer: false,
                    include_conversation_context: false,
                }],
            })
        }
        async fn get_definition(&self, id: &str) -> Result<AgentDefinitionRecord, RepositoryError> {
            Err(RepositoryError::NotFound {
                entity: "definition".into(),
                id: id.to_string(),
            })
        }
    }

    struct NullConversationRepository;
    #[async_trait]
    impl crate::repository::Repository<crate::repository::ConversationRecord> for NullConversationRepository {
        async fn get(&self, id: &str) -> Result<crate::repository::ConversationRecord, RepositoryError> {
            Err(RepositoryError::NotFound { entity: "conversation".into(), id: id.to_string() })
        }
        async fn update(&self, entity: crate::repository::ConversationRecord) -> Result<crate::repository::ConversationRecord, RepositoryError> {
            Ok(entity)
        }
        async fn remove(&self, _id: &str) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn query_by_owner(&self, _user_id: &str) -> Result<Vec<crate::repository::ConversationRecord>, RepositoryError> {
            Ok(Vec::new())
        }
        async fn query_by_definition(&self, _definition_id: &str) -> Result<Vec<crate::repository::ConversationRecord>, RepositoryError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn start_in_proactive_mode_transitions_to_presenting_and_suspends_on_first_item() {
        let manager = Arc::new(ConnectionManager::new());
        let mut conn = Connection::new("user-1");
        conn.state = ConnectionState::Active;
        let connection_id = conn.connection_id;
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        manager.register(conn.clone(), tx);
        let sender = Arc::new(crate::senders::ProtocolSender::new(manager));

        let deps = Arc::new(OrchestratorDeps {
            mediator: Arc::new(Mediator::new()),
            sender,
            llm: Arc::new(MockLlm::new("ok")),
            tool_executor: Arc::new(MockToolExecutor::always_fail()),
            template_source: Arc::new(OneItemTemplateSource),
            conversations: Arc::new(NullConversationRepository),
            agent_settings: crate::agent::AgentSettings {
                max_iterations: 1,
                max_tool_calls_per_iteration: 1,
                timeout: std::time::Duration::from_secs(1),
                stop_on_error: false,
                retry_on_error: false,
                max_retries: 0,
            },
        });

        let mut context = ConversationContext::new(connection_id, "conv-1", true, true);
        context.state = OrchestratorState::Ready;
        context.template_id = Some("tmpl-1".to_string());
        let ctx: SharedContext = Arc::new(Mutex::new(context));

        let handler = FlowHandler::new(deps);
        handler
            .handle(&conn, &ctx, InboundMessage::ControlFlowStart(crate::protocol::control::Empty {}))
            .await
            .unwrap();

        // Give the spawned background task a chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let guard = ctx.lock().await;
        assert_eq!(guard.state, OrchestratorState::Suspended);
        assert!(guard.current_item_state.is_some());
    }

    #[tokio::test]
    async fn item_time_limit_elapsing_advances_the_template_without_a_response() {
        let manager = Arc::new(ConnectionManager::new());
        let mut conn = Connection::new("user-1");
        conn.state = ConnectionState::Active;
        let connection_id = conn.connection_id;
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        manager.register(conn.clone(), tx);
        let sender = Arc::new(crate::senders::ProtocolSender::new(manager));

        let deps = Arc::new(OrchestratorDeps {
            mediator: Arc::new(Mediator::new()),
            sender,
            llm: Arc::new(MockLlm::new("ok")),
            tool_executor: Arc::new(MockToolExecutor::always_fail()),
            template_source: Arc::new(TimeLimitedTemplateSource),
            conversations: Arc::new(NullConversationRepository),
            agent_settings: crate::agent::AgentSettings {
                max_iterations: 1,
                max_tool_calls_per_iteration: 1,
                timeout: std::time::Duration::from_secs(1),
                stop_on_error: false,
                retry_on_error: false,
                max_retries: 0,
            },
        });

        let mut context = ConversationContext::new(connection_id, "conv-1", true, true);
        context.state = OrchestratorState::Ready;
        context.template_id = Some("tmpl-1".to_string());
        let ctx: SharedContext = Arc::new(Mutex::new(context));

        let handler = FlowHandler::new(deps);
        handler
            .handle(&conn, &ctx, InboundMessage::ControlFlowStart(crate::protocol::control::Empty {}))
            .await
            .unwrap();

        // The item has a one-second time limit and nothing ever notifies
        // `item_complete`; the background task must advance past it on its own.
        tokio::time::sleep(std::time::Duration::from_millis(1300)).await;

        let guard = ctx.lock().await;
        assert_eq!(guard.state, OrchestratorState::Completed);
    }
}
