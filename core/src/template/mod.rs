//! Renders a conversation template item-by-item (C10, spec §4.9).
//!
//! Runs as a background task spawned by the flow handler; it only ever talks
//! to the outside world through [`crate::senders::ProtocolSender`] and the LLM
//! — persistence and orchestrator-state transitions stay with the widget
//! handler (spec §4.8 step 5).

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::context::{ItemExecutionState, ScoringResult};
use crate::llm::{LlmClient, LlmError};
use crate::message::Message;
use crate::protocol::control;
use crate::repository::{ItemContentRecord, TemplateItemRecord};
use crate::senders::ProtocolSender;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("templated-content generation failed: {0}")]
    Llm(#[from] LlmError),
    #[error("template error: {0}")]
    Other(String),
}

/// The values substitutable into an item's `instructions` (spec §4.9 step 3).
pub struct PlaceholderContext {
    pub user_id: String,
    pub conversation_id: String,
    pub agent_name: String,
    /// 1-based (spec §4.9 step 3).
    pub current_item: u32,
    pub total_items: u32,
}

/// Expands `{{user_id}}`, `{{conversation_id}}`, `{{agent_name}}`,
/// `{{current_item}}`, `{{total_items}}`, `{{timestamp}}` (ISO-8601) over
/// `template` (spec §4.9 step 3). Unknown placeholders are left untouched.
pub fn substitute_placeholders(template: &str, ctx: &PlaceholderContext) -> String {
    template
        .replace("{{user_id}}", &ctx.user_id)
        .replace("{{conversation_id}}", &ctx.conversation_id)
        .replace("{{agent_name}}", &ctx.agent_name)
        .replace("{{current_item}}", &ctx.current_item.to_string())
        .replace("{{total_items}}", &ctx.total_items.to_string())
        .replace("{{timestamp}}", &chrono::Utc::now().to_rfc3339())
}

#[derive(Debug, Default, Deserialize)]
struct ParsedTemplatedContent {
    stem: Option<String>,
    options: Option<Value>,
    #[serde(rename = "correctAnswer")]
    correct_answer: Option<Value>,
    #[allow(dead_code)]
    explanation: Option<String>,
}

/// Parses an LLM response for templated content (spec §4.9 step 3): JSON
/// (bare or fenced) yields `{stem, options?, correctAnswer?, explanation?}`;
/// anything else is plain text assigned to `stem`.
fn parse_templated_response(raw: &str) -> ParsedTemplatedContent {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str(trimmed) {
            return parsed;
        }
    }
    if let Some(json_str) = extract_fenced_json(trimmed) {
        if let Ok(parsed) = serde_json::from_str(&json_str) {
            return parsed;
        }
    }
    ParsedTemplatedContent {
        stem: Some(trimmed.to_string()),
        ..Default::default()
    }
}

fn extract_fenced_json(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let after_fence = after_fence.strip_prefix("json").unwrap_or(after_fence);
    let end = after_fence.find("```")?;
    Some(after_fence[..end].trim().to_string())
}

#[derive(Debug, Deserialize)]
struct ParsedScoringResult {
    #[serde(rename = "isCorrect")]
    is_correct: bool,
    score: f64,
    #[serde(rename = "maxScore")]
    max_score: f64,
    feedback: Option<String>,
}

/// Drives the per-item render/score flow for one template, emitting wire
/// messages through `sender` (spec §4.9).
pub struct TemplateRunner {
    llm: Arc<dyn LlmClient>,
    sender: Arc<ProtocolSender>,
}

impl TemplateRunner {
    pub fn new(llm: Arc<dyn LlmClient>, sender: Arc<ProtocolSender>) -> Self {
        Self { llm, sender }
    }

    /// Renders one item: emits `control.item.context`, each content's widget
    /// (resolving templated ones via the LLM), and a confirmation widget if
    /// required. Returns the freshly-created [`ItemExecutionState`] for the
    /// caller to hand to the widget handler (spec §4.9 steps 1-4).
    pub async fn render_item(
        &self,
        connection_id: Uuid,
        placeholders: &PlaceholderContext,
        item: &TemplateItemRecord,
        item_index: u32,
        total_items: u32,
    ) -> Result<ItemExecutionState, TemplateError> {
        let required_widget_ids: BTreeSet<String> = item
            .contents
            .iter()
            .filter(|c| c.required)
            .map(|c| c.id.clone())
            .collect();

        self.sender
            .item_context(
                connection_id,
                control::ItemContext {
                    item_id: item.id.clone(),
                    item_index,
                    total_items,
                    time_limit_seconds: item.time_limit_seconds,
                },
            )
            .await;

        let mut widget_configs = std::collections::HashMap::new();

        for content in &item.contents {
            let rendered = if content.is_templated {
                self.render_templated_content(placeholders, content).await?
            } else {
                RenderedContent {
                    stem: content.stem.clone(),
                    options: content.options.clone(),
                }
            };

            widget_configs.insert(content.id.clone(), content.widget_config.clone());

            self.sender
                .widget_render(
                    connection_id,
                    control::WidgetRender {
                        item_id: item.id.clone(),
                        widget_id: content.id.clone(),
                        widget_type: content.widget_type.clone(),
                        stem: rendered.stem,
                        options: rendered.options,
                        widget_config: content.widget_config.clone(),
                        required: content.required,
                        skippable: content.skippable,
                        initial_value: content.initial_value.clone(),
                        show_user_response: content.show_user_response,
                        layout: None,
                        constraints: None,
                    },
                )
                .await;
        }

        if item.require_user_confirmation {
            self.sender
                .widget_render(
                    connection_id,
                    control::WidgetRender {
                        item_id: item.id.clone(),
                        widget_id: format!("{}-confirm", item.id),
                        widget_type: "confirmation".to_string(),
                        stem: Some(item.confirmation_button_text.clone()),
                        options: None,
                        widget_config: Value::Null,
                        required: true,
                        skippable: false,
                        initial_value: None,
                        show_user_response: false,
                        layout: None,
                        constraints: None,
                    },
                )
                .await;
        }

        let mut state = ItemExecutionState::new(item.id.clone(), item_index, required_widget_ids, item.require_user_confirmation);
        state.widget_configs = widget_configs;
        if item.provide_feedback {
            state.scoring_content = item.contents.iter().find(|c| c.correct_answer.is_some()).cloned();
        }
        Ok(state)
    }

    async fn render_templated_content(
        &self,
        placeholders: &PlaceholderContext,
        content: &ItemContentRecord,
    ) -> Result<RenderedContent, TemplateError> {
        let prompt = content
            .instructions
            .as_deref()
            .map(|instructions| substitute_placeholders(instructions, placeholders))
            .unwrap_or_default();

        let response = self
            .llm
            .chat(&[Message::system("Generate the requested assessment item content."), Message::user(prompt)])
            .await?;

        let parsed = parse_templated_response(&response.content);
        Ok(RenderedContent {
            stem: parsed.stem,
            options: parsed.options,
        })
    }

    /// One structured LLM call scoring a completed item (spec §4.9 step 6):
    /// `{stem, options, correctAnswer, userResponse} -> {isCorrect, score, maxScore, feedback}`.
    pub async fn score_item(&self, content: &ItemContentRecord, user_response: &Value) -> Result<ScoringResult, TemplateError> {
        let grading_input = serde_json::json!({
            "stem": content.stem,
            "options": content.options,
            "correctAnswer": content.correct_answer,
            "userResponse": user_response,
        });
        let prompt = format!(
            "Score this response. Reply with JSON {{\"isCorrect\":bool,\"score\":number,\"maxScore\":number,\"feedback\":string}}.\n\n{}",
            grading_input
        );

        let response = self
            .llm
            .chat(&[Message::system("You are an exam grader."), Message::user(prompt)])
            .await?;

        let parsed: ParsedScoringResult = serde_json::from_str(response.content.trim())
            .map_err(|e| TemplateError::Other(format!("unparseable scoring response: {e}")))?;

        Ok(ScoringResult {
            is_correct: parsed.is_correct,
            score: parsed.score,
            max_score: parsed.max_score,
            feedback: parsed.feedback,
        })
    }
}

struct RenderedContent {
    stem: Option<String>,
    options: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionState};
    use crate::connection::ConnectionManager;
    use crate::llm::MockLlm;

    fn placeholders() -> PlaceholderContext {
        PlaceholderContext {
            user_id: "user-1".into(),
            conversation_id: "conv-1".into(),
            agent_name: "tutor".into(),
            current_item: 1,
            total_items: 2,
        }
    }

    #[test]
    fn substitutes_all_known_placeholders() {
        let out = substitute_placeholders(
            "user={{user_id}} conv={{conversation_id}} item={{current_item}}/{{total_items}}",
            &placeholders(),
        );
        assert_eq!(out, "user=user-1 conv=conv-1 item=1/2");
    }

    #[test]
    fn parses_fenced_json_response() {
        let raw = "Here you go:\n```json\n{\"stem\": \"2+2?\", \"options\": [\"3\",\"4\"]}\n```";
        let parsed = parse_templated_response(raw);
        assert_eq!(parsed.stem.as_deref(), Some("2+2?"));
        assert!(parsed.options.is_some());
    }

    #[test]
    fn plain_text_response_becomes_stem() {
        let parsed = parse_templated_response("What is the capital of France?");
        assert_eq!(parsed.stem.as_deref(), Some("What is the capital of France?"));
        assert!(parsed.options.is_none());
    }

    #[tokio::test]
    async fn render_item_emits_context_and_widget_for_each_content() {
        let manager = Arc::new(ConnectionManager::new());
        let mut conn = Connection::new("user-1");
        conn.state = ConnectionState::Active;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let id = manager.register(conn, tx);

        let sender = Arc::new(ProtocolSender::new(manager));
        let runner = TemplateRunner::new(Arc::new(MockLlm::new("plain stem text")), sender);

        let item = TemplateItemRecord {
            id: "item-1".into(),
            contents: vec![ItemContentRecord {
                id: "w1".into(),
                widget_type: "short_answer".into(),
                is_templated: true,
                source_id: None,
                widget_config: Value::Null,
                stem: None,
                options: None,
                required: true,
                skippable: false,
                initial_value: None,
                correct_answer: Some(serde_json::json!("Paris")),
                show_user_response: true,
                instructions: Some("Ask about {{agent_name}}".into()),
            }],
            enable_chat_input: false,
            time_limit_seconds: None,
            require_user_confirmation: true,
            confirmation_button_text: "Confirm".into(),
            provide_feedback: true,
            reveal_correct_answer: false,
            include_conversation_context: false,
        };

        let state = runner
            .render_item(id, &placeholders(), &item, 0, 1)
            .await
            .unwrap();

        assert!(state.required_widget_ids.contains("w1"));

        let mut saw_item_context = false;
        let mut saw_widget_render = false;
        let mut saw_confirm_widget = false;
        while let Ok(msg) = rx.try_recv() {
            match msg.message_type.as_str() {
                "control.item.context" => saw_item_context = true,
                "control.widget.render" => {
                    saw_widget_render = true;
                    if msg.payload.get("widgetId").and_then(|v| v.as_str()) == Some("item-1-confirm") {
                        saw_confirm_widget = true;
                    }
                    assert!(msg.payload.get("correctAnswer").is_none());
                }
                _ => {}
            }
        }
        assert!(saw_item_context);
        assert!(saw_widget_render);
        assert!(saw_confirm_widget);
    }
}
