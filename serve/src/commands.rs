//! [`RequestHandler`] implementations backing the mediator commands the
//! orchestrator handlers dispatch (spec §4.13), grounded on the bundled
//! in-memory [`ConversationRepository`].

use std::sync::Arc;

use async_trait::async_trait;

use conveyor_core::mediator::{
    AdvanceTemplateCommand, AdvanceTemplateResult, CompleteMessageCommand, OperationResult, RecordItemResponseCommand, RequestHandler,
    SendMessageCommand,
};
use conveyor_core::repository::{ConversationMessage, ConversationRepository, ItemResponseRecord, Repository, RepositoryError, TemplateSource};

/// Retries an optimistic-concurrency update a handful of times before giving
/// up; under single-writer-per-conversation load (spec §9 design note: one
/// connection drives one conversation) contention is rare.
async fn update_with_retry<F>(repo: &ConversationRepository, conversation_id: &str, mut mutate: F) -> Result<(), RepositoryError>
where
    F: FnMut(&mut conveyor_core::repository::ConversationRecord),
{
    for _ in 0..5 {
        let mut record = repo.get(conversation_id).await?;
        mutate(&mut record);
        match repo.update(record).await {
            Ok(_) => return Ok(()),
            Err(RepositoryError::VersionConflict { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(RepositoryError::Other(format!("version conflict retries exhausted for conversation {conversation_id}")))
}

pub struct SendMessageHandler {
    conversations: Arc<ConversationRepository>,
}

impl SendMessageHandler {
    pub fn new(conversations: Arc<ConversationRepository>) -> Self {
        Self { conversations }
    }
}

#[async_trait]
impl RequestHandler<SendMessageCommand> for SendMessageHandler {
    async fn handle(&self, request: SendMessageCommand) -> OperationResult<conveyor_core::mediator::SendMessageResult> {
        let assistant_message_id = uuid::Uuid::new_v4().to_string();
        let user_message_id = uuid::Uuid::new_v4().to_string();
        let result = update_with_retry(&self.conversations, &request.conversation_id, |record| {
            record.messages.push(ConversationMessage {
                id: user_message_id.clone(),
                role: "user".to_string(),
                content: request.content.clone(),
            });
        })
        .await;

        match result {
            Ok(()) => OperationResult::ok(conveyor_core::mediator::SendMessageResult { assistant_message_id }),
            Err(RepositoryError::NotFound { entity, id }) => OperationResult::not_found(&entity, &id),
            Err(e) => OperationResult::internal_server_error(e.to_string()),
        }
    }
}

pub struct CompleteMessageHandler {
    conversations: Arc<ConversationRepository>,
}

impl CompleteMessageHandler {
    pub fn new(conversations: Arc<ConversationRepository>) -> Self {
        Self { conversations }
    }
}

#[async_trait]
impl RequestHandler<CompleteMessageCommand> for CompleteMessageHandler {
    async fn handle(&self, request: CompleteMessageCommand) -> OperationResult<()> {
        let result = update_with_retry(&self.conversations, &request.conversation_id, |record| {
            record.messages.push(ConversationMessage {
                id: request.message_id.clone(),
                role: "assistant".to_string(),
                content: request.content.clone(),
            });
        })
        .await;

        match result {
            Ok(()) => OperationResult::ok(()),
            Err(RepositoryError::NotFound { entity, id }) => OperationResult::not_found(&entity, &id),
            Err(e) => OperationResult::internal_server_error(e.to_string()),
        }
    }
}

pub struct RecordItemResponseHandler {
    conversations: Arc<ConversationRepository>,
}

impl RecordItemResponseHandler {
    pub fn new(conversations: Arc<ConversationRepository>) -> Self {
        Self { conversations }
    }
}

#[async_trait]
impl RequestHandler<RecordItemResponseCommand> for RecordItemResponseHandler {
    async fn handle(&self, request: RecordItemResponseCommand) -> OperationResult<()> {
        let result = update_with_retry(&self.conversations, &request.conversation_id, |record| {
            record.item_responses.push(ItemResponseRecord {
                item_id: request.item_id.clone(),
                item_index: request.item_index,
                responses: request.responses.clone(),
                response_time_ms: request.response_time_ms,
                is_correct: None,
                score: None,
            });
        })
        .await;

        match result {
            Ok(()) => OperationResult::ok(()),
            Err(RepositoryError::NotFound { entity, id }) => OperationResult::not_found(&entity, &id),
            Err(e) => OperationResult::internal_server_error(e.to_string()),
        }
    }
}

pub struct AdvanceTemplateHandler {
    conversations: Arc<ConversationRepository>,
    template_source: Arc<dyn TemplateSource>,
}

impl AdvanceTemplateHandler {
    pub fn new(conversations: Arc<ConversationRepository>, template_source: Arc<dyn TemplateSource>) -> Self {
        Self { conversations, template_source }
    }
}

#[async_trait]
impl RequestHandler<AdvanceTemplateCommand> for AdvanceTemplateHandler {
    async fn handle(&self, request: AdvanceTemplateCommand) -> OperationResult<AdvanceTemplateResult> {
        let record = match self.conversations.get(&request.conversation_id).await {
            Ok(r) => r,
            Err(RepositoryError::NotFound { entity, id }) => return OperationResult::not_found(&entity, &id),
            Err(e) => return OperationResult::internal_server_error(e.to_string()),
        };

        let Some(template_id) = &record.template_id else {
            return OperationResult::bad_request("conversation has no bound template");
        };

        let total_items = match self.template_source.get_template(template_id).await {
            Ok(t) => t.items.len() as u32,
            Err(e) => return OperationResult::internal_server_error(e.to_string()),
        };

        let next_item_index = record.current_item_index + 1;
        let completed = next_item_index >= total_items;

        let update_result = update_with_retry(&self.conversations, &request.conversation_id, |record| {
            record.current_item_index = next_item_index;
        })
        .await;

        match update_result {
            Ok(()) => OperationResult::ok(AdvanceTemplateResult { next_item_index, completed }),
            Err(RepositoryError::NotFound { entity, id }) => OperationResult::not_found(&entity, &id),
            Err(e) => OperationResult::internal_server_error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::mediator::UserInfo;
    use conveyor_core::repository::ConversationRecord;

    use crate::storage::{InMemoryConversationRepository, InMemoryTemplateSource};

    fn fixture_conversation() -> ConversationRecord {
        ConversationRecord {
            id: "conv-1".to_string(),
            owner_user_id: "user-1".to_string(),
            definition_id: Some("default-agent".to_string()),
            template_id: Some("default-template".to_string()),
            messages: Vec::new(),
            current_item_index: 0,
            item_responses: Vec::new(),
            version: 0,
        }
    }

    fn user_info() -> UserInfo {
        UserInfo { user_id: "user-1".to_string(), roles: Vec::new() }
    }

    #[tokio::test]
    async fn send_message_appends_to_conversation_and_returns_id() {
        let conversations = Arc::new(InMemoryConversationRepository::new());
        conversations.put(fixture_conversation()).await;
        let handler = SendMessageHandler::new(conversations.clone());

        let result = handler
            .handle(SendMessageCommand { conversation_id: "conv-1".to_string(), content: "hello".to_string(), user_info: user_info() })
            .await;

        assert!(result.success);
        assert!(!result.data.unwrap().assistant_message_id.is_empty());
        let stored = conversations.get("conv-1").await.unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].content, "hello");
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn send_message_against_unknown_conversation_is_not_found() {
        let conversations = Arc::new(InMemoryConversationRepository::new());
        let handler = SendMessageHandler::new(conversations);

        let result = handler
            .handle(SendMessageCommand { conversation_id: "missing".to_string(), content: "hi".to_string(), user_info: user_info() })
            .await;

        assert!(!result.success);
        assert_eq!(result.status_code, 404);
    }

    #[tokio::test]
    async fn advance_template_reports_completed_on_last_item() {
        let conversations = Arc::new(InMemoryConversationRepository::new());
        conversations.put(fixture_conversation()).await;
        let template_source: Arc<dyn conveyor_core::repository::TemplateSource> = Arc::new(InMemoryTemplateSource::with_default_template());
        let handler = AdvanceTemplateHandler::new(conversations, template_source);

        let result = handler.handle(AdvanceTemplateCommand { conversation_id: "conv-1".to_string(), user_info: user_info() }).await;

        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data.next_item_index, 1);
        assert!(data.completed);
    }

    #[tokio::test]
    async fn record_item_response_persists_responses() {
        let conversations = Arc::new(InMemoryConversationRepository::new());
        conversations.put(fixture_conversation()).await;
        let handler = RecordItemResponseHandler::new(conversations.clone());

        let result = handler
            .handle(RecordItemResponseCommand {
                conversation_id: "conv-1".to_string(),
                item_id: "welcome".to_string(),
                item_index: 0,
                responses: serde_json::json!({"welcome-text": "hi there"}),
                response_time_ms: 1200,
                user_info: user_info(),
            })
            .await;

        assert!(result.success);
        let stored = conversations.get("conv-1").await.unwrap();
        assert_eq!(stored.item_responses.len(), 1);
        assert_eq!(stored.item_responses[0].item_id, "welcome");
    }
}
