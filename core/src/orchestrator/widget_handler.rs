//! `data.response.submit` (spec §4.8).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use super::{OrchestratorDeps, SharedContext};
use crate::connection::Connection;
use crate::context::OrchestratorState;
use crate::mediator::{AdvanceTemplateCommand, RecordItemResponseCommand, UserInfo};
use crate::protocol::InboundMessage;
use crate::router::{Handler, RouterError};
use crate::template::TemplateRunner;

pub struct WidgetHandler {
    deps: Arc<OrchestratorDeps>,
}

impl WidgetHandler {
    pub fn new(deps: Arc<OrchestratorDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Handler<SharedContext> for WidgetHandler {
    async fn handle(&self, connection: &Connection, ctx: &SharedContext, message: InboundMessage) -> Result<(), RouterError> {
        let InboundMessage::DataResponseSubmit(payload) = message else {
            return Err(RouterError::InvalidPayload("data.response.submit".to_string()));
        };
        let connection_id = connection.connection_id;

        self.deps.sender.response_ack(connection_id, &payload.item_id, &payload.widget_id).await;

        let mut guard = ctx.lock().await;
        guard.touch();

        if guard.current_item_state.is_none() {
            // Nothing pending for this connection; a stray or duplicated submit.
            return Ok(());
        }

        let is_late = guard.current_item_state.as_ref().unwrap().item_id != payload.item_id;
        if is_late {
            if !guard.is_proactive {
                guard.transition(OrchestratorState::Ready);
            }
            return Ok(());
        }

        {
            let item_state = guard.current_item_state.as_mut().unwrap();
            let confirm_widget_id = format!("{}-confirm", item_state.item_id);
            if payload.widget_id == confirm_widget_id {
                item_state.user_confirmed = true;
            } else {
                item_state.record_response(&payload.widget_id, payload.value.clone());
            }
        }

        if payload.batch {
            return Ok(());
        }

        if !guard.current_item_state.as_ref().unwrap().is_complete() {
            return Ok(());
        }

        guard.current_item_state.as_mut().unwrap().completed_at = Some(Instant::now());

        let conversation_id = guard.conversation_id.clone();
        let is_proactive = guard.is_proactive;
        let item_state = guard.current_item_state.clone().unwrap();
        drop(guard);

        let scoring_result = if let Some(content) = &item_state.scoring_content {
            let runner = TemplateRunner::new(self.deps.llm.clone(), self.deps.sender.clone());
            let user_response = serde_json::to_value(&item_state.widget_responses).unwrap_or(Value::Null);
            match runner.score_item(content, &user_response).await {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::warn!(item_id = %item_state.item_id, error = %e, "item scoring failed");
                    None
                }
            }
        } else {
            None
        };

        let response_time_ms = item_state
            .completed_at
            .map(|c| c.duration_since(item_state.started_at).as_millis() as u64)
            .unwrap_or(0);

        let user_info = UserInfo {
            user_id: connection.user_id.clone(),
            roles: Vec::new(),
        };

        self.deps
            .mediator
            .execute(RecordItemResponseCommand {
                conversation_id: conversation_id.clone(),
                item_id: item_state.item_id.clone(),
                item_index: item_state.item_index,
                responses: serde_json::to_value(&item_state.widget_responses).unwrap_or(Value::Null),
                response_time_ms,
                user_info: user_info.clone(),
            })
            .await;

        let advance = self
            .deps
            .mediator
            .execute(AdvanceTemplateCommand {
                conversation_id: conversation_id.clone(),
                user_info,
            })
            .await;

        let mut guard = ctx.lock().await;
        guard.current_item_state = None;
        if let Some(result) = scoring_result {
            tracing::debug!(item_id = %item_state.item_id, score = result.score, "item scored");
        }

        if let Some(advance_result) = advance.data {
            if advance_result.completed {
                guard.transition(OrchestratorState::Completed);
            } else {
                guard.current_item_index = advance_result.next_item_index;
                if !is_proactive {
                    guard.transition(OrchestratorState::Ready);
                }
                // In proactive mode the background template runner task owns
                // the READY/PRESENTING transition for the next item; it wakes
                // up off `item_complete` below.
            }
        }
        guard.item_complete.notify_one();

        Ok(())
    }
}
