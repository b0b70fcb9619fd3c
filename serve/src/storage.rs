//! Bundled in-memory storage backends.
//!
//! Persistent storage is explicitly out of scope for the orchestrator core —
//! it only depends on the [`conveyor_core::repository`] and
//! [`conveyor_core::access`] traits. This module supplies the minimal
//! concrete adapters the standalone binary needs to actually run without an
//! external database, seeded with one fixed agent/template pair useful for
//! local exercising and the e2e tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use conveyor_core::access::{AccessPolicy, AccessResolverError, PolicySource};
use conveyor_core::repository::{
    AgentDefinitionRecord, ConversationRecord, ConversationTemplateRecord, ItemContentRecord, Repository, RepositoryError, TemplateItemRecord,
    TemplateSource,
};

pub struct InMemoryConversationRepository {
    records: Mutex<HashMap<String, ConversationRecord>>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self { records: Mutex::new(HashMap::new()) }
    }

    /// Inserts (or overwrites) a conversation, used both by connection setup
    /// (first-seen conversation id) and by tests.
    pub async fn put(&self, record: ConversationRecord) {
        self.records.lock().await.insert(record.id.clone(), record);
    }
}

impl Default for InMemoryConversationRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository<ConversationRecord> for InMemoryConversationRepository {
    async fn get(&self, id: &str) -> Result<ConversationRecord, RepositoryError> {
        self.records
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound { entity: "conversation".into(), id: id.to_string() })
    }

    async fn update(&self, entity: ConversationRecord) -> Result<ConversationRecord, RepositoryError> {
        let mut guard = self.records.lock().await;
        if let Some(existing) = guard.get(&entity.id) {
            if existing.version != entity.version {
                return Err(RepositoryError::VersionConflict {
                    entity: "conversation".into(),
                    id: entity.id.clone(),
                    expected: entity.version,
                    actual: existing.version,
                });
            }
        }
        let mut updated = entity;
        updated.version += 1;
        guard.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    async fn remove(&self, id: &str) -> Result<(), RepositoryError> {
        self.records.lock().await.remove(id);
        Ok(())
    }

    async fn query_by_owner(&self, user_id: &str) -> Result<Vec<ConversationRecord>, RepositoryError> {
        Ok(self.records.lock().await.values().filter(|r| r.owner_user_id == user_id).cloned().collect())
    }

    async fn query_by_definition(&self, definition_id: &str) -> Result<Vec<ConversationRecord>, RepositoryError> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.definition_id.as_deref() == Some(definition_id))
            .cloned()
            .collect())
    }
}

/// Holds a single fixed agent definition and conversation template, enough
/// for a connection to run end to end without a real content-management
/// backend.
pub struct InMemoryTemplateSource {
    templates: HashMap<String, ConversationTemplateRecord>,
    definitions: HashMap<String, AgentDefinitionRecord>,
}

impl InMemoryTemplateSource {
    pub fn with_default_template() -> Self {
        let template = ConversationTemplateRecord {
            id: "default-template".to_string(),
            agent_starts_first: true,
            allow_navigation: false,
            allow_backward_navigation: false,
            enable_chat_input_initially: false,
            display_progress_indicator: true,
            display_final_score_report: false,
            shuffle_items: false,
            continue_after_completion: false,
            items: vec![TemplateItemRecord {
                id: "welcome".to_string(),
                contents: vec![ItemContentRecord {
                    id: "welcome-text".to_string(),
                    widget_type: "short_answer".to_string(),
                    is_templated: false,
                    source_id: None,
                    widget_config: serde_json::Value::Null,
                    stem: Some("What would you like help with today?".to_string()),
                    options: None,
                    required: true,
                    skippable: false,
                    initial_value: None,
                    correct_answer: None,
                    show_user_response: true,
                    instructions: None,
                }],
                enable_chat_input: true,
                time_limit_seconds: None,
                require_user_confirmation: false,
                confirmation_button_text: "Continue".to_string(),
                provide_feedback: false,
                reveal_correct_answer: false,
                include_conversation_context: false,
            }],
        };
        let definition = AgentDefinitionRecord {
            id: "default-agent".to_string(),
            display_name: "Assistant".to_string(),
            system_prompt: "You are a helpful assistant.".to_string(),
            tool_allow_list: Vec::new(),
            model_override: None,
            conversation_template_id: Some(template.id.clone()),
        };

        let mut templates = HashMap::new();
        templates.insert(template.id.clone(), template);
        let mut definitions = HashMap::new();
        definitions.insert(definition.id.clone(), definition);

        Self { templates, definitions }
    }
}

#[async_trait]
impl TemplateSource for InMemoryTemplateSource {
    async fn get_template(&self, id: &str) -> Result<ConversationTemplateRecord, RepositoryError> {
        self.templates
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound { entity: "template".into(), id: id.to_string() })
    }

    async fn get_definition(&self, id: &str) -> Result<AgentDefinitionRecord, RepositoryError> {
        self.definitions
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound { entity: "definition".into(), id: id.to_string() })
    }
}

/// Grants every resolved group to every caller. Real deployments back
/// [`PolicySource`] with an admin-managed policy store; absent one, the
/// permissive default keeps the tool-access gate from silently blocking
/// every call.
pub struct AllowAllPolicySource {
    group_ids: std::collections::BTreeSet<String>,
}

impl AllowAllPolicySource {
    pub fn new(group_ids: impl IntoIterator<Item = String>) -> Self {
        Self { group_ids: group_ids.into_iter().collect() }
    }
}

#[async_trait]
impl PolicySource for AllowAllPolicySource {
    async fn active_policies(&self) -> Result<Vec<AccessPolicy>, AccessResolverError> {
        Ok(vec![AccessPolicy {
            id: "allow-all".to_string(),
            name: "allow all".to_string(),
            claim_matchers: Vec::new(),
            allowed_group_ids: self.group_ids.iter().cloned().collect(),
            priority: 0,
            active: true,
        }])
    }

    async fn active_group_ids(&self) -> Result<std::collections::BTreeSet<String>, AccessResolverError> {
        Ok(self.group_ids.clone())
    }
}

impl Default for AllowAllPolicySource {
    fn default() -> Self {
        Self::new([])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::repository::ConversationRecord;

    fn fixture() -> ConversationRecord {
        ConversationRecord {
            id: "conv-1".to_string(),
            owner_user_id: "user-1".to_string(),
            definition_id: None,
            template_id: None,
            messages: Vec::new(),
            current_item_index: 0,
            item_responses: Vec::new(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn update_bumps_version_on_success() {
        let repo = InMemoryConversationRepository::new();
        repo.put(fixture()).await;
        let updated = repo.update(repo.get("conv-1").await.unwrap()).await.unwrap();
        assert_eq!(updated.version, 1);
    }

    #[tokio::test]
    async fn update_rejects_stale_version() {
        let repo = InMemoryConversationRepository::new();
        repo.put(fixture()).await;
        repo.update(repo.get("conv-1").await.unwrap()).await.unwrap();
        let stale = fixture();
        let result = repo.update(stale).await;
        assert!(matches!(result, Err(RepositoryError::VersionConflict { .. })));
    }

    #[tokio::test]
    async fn default_template_has_one_welcome_item() {
        let source = InMemoryTemplateSource::with_default_template();
        let template = source.get_template("default-template").await.unwrap();
        assert_eq!(template.items.len(), 1);
        assert!(template.agent_starts_first);
    }

    #[tokio::test]
    async fn allow_all_policy_grants_configured_groups() {
        let source = AllowAllPolicySource::new(["group-a".to_string()]);
        let policies = source.active_policies().await.unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].allowed_group_ids, vec!["group-a".to_string()]);
    }
}
