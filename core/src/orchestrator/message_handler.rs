//! `data.message.send` (spec §4.8).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{OrchestratorDeps, SharedContext};
use crate::agent::{run_stream, AgentEvent, RunRequest};
use crate::connection::Connection;
use crate::context::OrchestratorState;
use crate::mediator::{CompleteMessageCommand, SendMessageCommand, UserInfo};
use crate::message::{Message, Role};
use crate::protocol::system::{ErrorCategory, ErrorCode, SystemError};
use crate::protocol::InboundMessage;
use crate::router::{Handler, RouterError};

fn role_from_str(role: &str) -> Role {
    match role {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

pub struct MessageHandler {
    deps: Arc<OrchestratorDeps>,
}

impl MessageHandler {
    pub fn new(deps: Arc<OrchestratorDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Handler<SharedContext> for MessageHandler {
    async fn handle(&self, connection: &Connection, ctx: &SharedContext, message: InboundMessage) -> Result<(), RouterError> {
        let InboundMessage::DataMessageSend(payload) = message else {
            return Err(RouterError::InvalidPayload("data.message.send".to_string()));
        };
        let connection_id = connection.connection_id;
        let user_info = UserInfo {
            user_id: connection.user_id.clone(),
            roles: Vec::new(),
        };

        let conversation_id = {
            let mut guard = ctx.lock().await;
            if !guard.state.accepts_message_send() {
                let state = guard.state;
                drop(guard);
                self.deps
                    .sender
                    .error(
                        connection_id,
                        SystemError::new(
                            ErrorCategory::Business,
                            ErrorCode::InvalidState,
                            format!("data.message.send is not valid in state {state:?}"),
                            true,
                        ),
                    )
                    .await;
                return Err(RouterError::InvalidState("data.message.send".to_string()));
            }
            guard.transition(OrchestratorState::Processing);
            guard.touch();
            guard.conversation_id.clone()
        };

        self.deps
            .sender
            .message_ack(connection_id, &uuid::Uuid::new_v4().to_string())
            .await;

        let send_result = self
            .deps
            .mediator
            .execute(SendMessageCommand {
                conversation_id: conversation_id.clone(),
                content: payload.content.clone(),
                user_info: user_info.clone(),
            })
            .await;

        let Some(send_result) = send_result.data else {
            return self.fail(connection_id, ctx, "failed to persist user message").await;
        };

        let conversation_history = match self.deps.conversations.get(&conversation_id).await {
            Ok(record) => {
                let mut stored = record.messages;
                // `SendMessageCommand` above already appended the current user
                // turn; `run_loop` appends `user_message` itself, so drop it
                // here to avoid sending it to the model twice.
                stored.pop();
                stored
                    .into_iter()
                    .map(|m| Message {
                        role: role_from_str(&m.role),
                        content: m.content,
                        name: None,
                        tool_call_id: None,
                        tool_calls: Vec::new(),
                    })
                    .collect()
            }
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "failed to load conversation history, starting from an empty history");
                Vec::new()
            }
        };

        let run_request = RunRequest {
            user_message: payload.content.clone(),
            conversation_history,
            system_prompt: "You are a helpful assistant.".to_string(),
            tools: Vec::new(),
            access_token: connection.access_token.clone(),
        };

        let (events_tx, mut events_rx) = mpsc::channel(256);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        tokio::spawn(run_stream(
            run_request,
            self.deps.llm.clone(),
            self.deps.tool_executor.clone(),
            self.deps.agent_settings.clone(),
            events_tx,
            cancel_rx,
        ));

        let message_id = send_result.assistant_message_id.clone();
        let mut final_content: Option<String> = None;

        while let Some(event) = events_rx.recv().await {
            match event {
                AgentEvent::LlmResponseChunk { text, .. } => {
                    self.deps.sender.content_chunk(connection_id, &message_id, &text, false).await;
                }
                AgentEvent::ToolCallsDetected { calls, .. } => {
                    for call in calls {
                        self.deps
                            .sender
                            .tool_call(
                                connection_id,
                                crate::protocol::data_out::ToolCall {
                                    call_id: call.call_id,
                                    name: call.name,
                                    arguments: call.arguments,
                                },
                            )
                            .await;
                    }
                }
                AgentEvent::ToolExecutionCompleted { call_id, result, .. } => {
                    self.deps
                        .sender
                        .tool_result(
                            connection_id,
                            crate::protocol::data_out::ToolResult {
                                call_id,
                                success: true,
                                result: Some(result),
                                error: None,
                            },
                        )
                        .await;
                }
                AgentEvent::ToolExecutionFailed { call_id, error, .. } => {
                    self.deps
                        .sender
                        .tool_result(
                            connection_id,
                            crate::protocol::data_out::ToolResult {
                                call_id,
                                success: false,
                                result: None,
                                error: Some(error),
                            },
                        )
                        .await;
                }
                AgentEvent::RunCompleted { content } => {
                    final_content = Some(content);
                }
                AgentEvent::RunFailed { reason } => {
                    self.deps.sender.content_complete(connection_id, &message_id, "assistant", "").await;
                    self.fail(connection_id, ctx, &reason).await.ok();
                    return Ok(());
                }
                _ => {}
            }
        }

        let Some(content) = final_content else {
            return self.fail(connection_id, ctx, "agent run ended without a completion event").await;
        };

        self.deps.sender.content_complete(connection_id, &message_id, "assistant", &content).await;

        self.deps
            .mediator
            .execute(CompleteMessageCommand {
                conversation_id: conversation_id.clone(),
                message_id,
                content,
                user_info,
            })
            .await;

        let mut guard = ctx.lock().await;
        guard.transition(OrchestratorState::Ready);
        guard.touch();

        Ok(())
    }
}

impl MessageHandler {
    async fn fail(&self, connection_id: uuid::Uuid, ctx: &SharedContext, reason: &str) -> Result<(), RouterError> {
        let mut guard = ctx.lock().await;
        guard.transition(OrchestratorState::Error);
        drop(guard);
        self.deps
            .sender
            .error(
                connection_id,
                SystemError::new(ErrorCategory::Server, ErrorCode::MessageError, reason, true),
            )
            .await;
        Err(RouterError::HandlerError(reason.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, ConnectionState};
    use crate::context::ConversationContext;
    use crate::llm::MockLlm;
    use crate::mediator::{OperationResult, Request, RequestHandler};
    use crate::repository::{AgentDefinitionRecord, ConversationTemplateRecord, RepositoryError};
    use crate::tool_exec::MockToolExecutor;
    use async_trait::async_trait as at;

    struct FakeSendHandler;
    #[at]
    impl RequestHandler<SendMessageCommand> for FakeSendHandler {
        async fn handle(&self, _r: SendMessageCommand) -> OperationResult<crate::mediator::SendMessageResult> {
            OperationResult::ok(crate::mediator::SendMessageResult {
                assistant_message_id: "assistant-1".to_string(),
            })
        }
    }

    struct FakeCompleteHandler;
    #[at]
    impl RequestHandler<CompleteMessageCommand> for FakeCompleteHandler {
        async fn handle(&self, _r: CompleteMessageCommand) -> OperationResult<()> {
            OperationResult::ok(())
        }
    }

    struct EmptyConversationRepository;
    #[at]
    impl crate::repository::Repository<crate::repository::ConversationRecord> for EmptyConversationRepository {
        async fn get(&self, id: &str) -> Result<crate::repository::ConversationRecord, RepositoryError> {
            Ok(crate::repository::ConversationRecord {
                id: id.to_string(),
                owner_user_id: "user-1".to_string(),
                definition_id: None,
                template_id: None,
                messages: vec![crate::repository::ConversationMessage {
                    id: "m1".to_string(),
                    role: "user".to_string(),
                    content: "hi".to_string(),
                }],
                current_item_index: 0,
                item_responses: Vec::new(),
                version: 0,
            })
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

    struct NullTemplateSource;
    #[at]
    impl crate::repository::TemplateSource for NullTemplateSource {
        async fn get_template(&self, id: &str) -> Result<ConversationTemplateRecord, RepositoryError> {
            Err(RepositoryError::NotFound {
                entity: "template".into(),
                id: id.to_string(),
            })
        }
        async fn get_definition(&self, id: &str) -> Result<AgentDefinitionRecord, RepositoryError> {
            Err(RepositoryError::NotFound {
                entity: "definition".into(),
                id: id.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn reply_with_no_tool_calls_completes_the_conversation_turn() {
        let mut mediator = crate::mediator::Mediator::new();
        mediator.register::<SendMessageCommand>(Arc::new(FakeSendHandler));
        mediator.register::<CompleteMessageCommand>(Arc::new(FakeCompleteHandler));

        let manager = Arc::new(ConnectionManager::new());
        let mut conn = crate::connection::Connection::new("user-1");
        conn.state = ConnectionState::Active;
        let connection_id = conn.connection_id;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        manager.register(conn.clone(), tx);
        let sender = Arc::new(crate::senders::ProtocolSender::new(manager));

        let deps = Arc::new(OrchestratorDeps {
            mediator: Arc::new(mediator),
            sender,
            llm: Arc::new(MockLlm::new("final answer")),
            tool_executor: Arc::new(MockToolExecutor::always_fail()),
            template_source: Arc::new(NullTemplateSource),
            conversations: Arc::new(EmptyConversationRepository),
            agent_settings: crate::agent::AgentSettings {
                max_iterations: 3,
                max_tool_calls_per_iteration: 5,
                timeout: std::time::Duration::from_secs(5),
                stop_on_error: false,
                retry_on_error: false,
                max_retries: 0,
            },
        });

        let mut ctx = ConversationContext::new(connection_id, "conv-1", false, false);
        ctx.state = OrchestratorState::Ready;
        let ctx: SharedContext = Arc::new(Mutex::new(ctx));

        let handler = MessageHandler::new(deps);
        let message = InboundMessage::DataMessageSend(crate::protocol::data_in::MessageSend { content: "hi".into() });

        handler.handle(&conn, &ctx, message).await.unwrap();

        assert_eq!(ctx.lock().await.state, OrchestratorState::Ready);

        let mut saw_complete = false;
        while let Ok(msg) = rx.try_recv() {
            if msg.message_type == "data.content.complete" {
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }
}
