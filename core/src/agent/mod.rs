//! The ReAct tool-calling loop (C11, spec §4.10).
//!
//! Expressed as an explicit state machine pushing [`AgentEvent`]s into a
//! channel rather than an async generator (spec §9 design note): callers drain
//! the channel and translate events to wire messages via [`crate::senders`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::llm::{Chunk, LlmClient, LlmError, ToolChoiceMode, ToolDefinition};
use crate::message::Message;
use crate::tool_exec::{ToolExecutionResult, ToolExecutor};

/// A tool call requested by the model, fully accumulated (spec §4.10).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// Tuning knobs for one run (spec §6; normally sourced from `AppConfig`).
#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub max_iterations: u32,
    pub max_tool_calls_per_iteration: u32,
    pub timeout: Duration,
    pub stop_on_error: bool,
    pub retry_on_error: bool,
    pub max_retries: u32,
}

/// Inputs to [`run_stream`] (spec §4.10).
pub struct RunRequest {
    pub user_message: String,
    pub conversation_history: Vec<Message>,
    pub system_prompt: String,
    pub tools: Vec<ToolDefinition>,
    pub access_token: Option<String>,
}

/// One event in the agent's run. Carries an iteration index and, where
/// relevant, a message id (spec §4.10).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentEvent {
    RunStarted,
    IterationStarted { iteration: u32 },
    LlmRequestStarted { iteration: u32 },
    LlmResponseChunk { iteration: u32, message_id: String, text: String },
    LlmResponseCompleted { iteration: u32, message_id: String, content: String },
    ToolCallsDetected { iteration: u32, calls: Vec<ToolCall> },
    ToolExecutionStarted { iteration: u32, call: ToolCall },
    ToolExecutionCompleted { iteration: u32, call_id: String, result: Value },
    ToolExecutionFailed { iteration: u32, call_id: String, error: String },
    MessageAdded { message: Message },
    IterationCompleted { iteration: u32 },
    RunCompleted { content: String },
    RunFailed { reason: String },
}

/// Drives one run, emitting [`AgentEvent`]s onto `events` (spec §4.10
/// pseudocode). Returns once the run terminates (completed, failed, or
/// canceled); the caller owns the receiving end of `events`.
pub async fn run_stream(
    request: RunRequest,
    llm: Arc<dyn LlmClient>,
    tool_executor: Arc<dyn ToolExecutor>,
    settings: AgentSettings,
    events: mpsc::Sender<AgentEvent>,
    mut cancel: oneshot::Receiver<()>,
) {
    let deadline = async {
        let _ = timeout(settings.timeout, std::future::pending::<()>()).await;
    };

    let access_token = request.access_token.clone();
    tokio::select! {
        _ = run_loop(request, llm, tool_executor, &settings, events.clone(), access_token) => {}
        _ = deadline => {
            let _ = events.send(AgentEvent::RunFailed { reason: "timeout".to_string() }).await;
        }
        _ = &mut cancel => {
            tracing::info!("agent run canceled");
        }
    }
}

async fn run_loop(
    request: RunRequest,
    llm: Arc<dyn LlmClient>,
    tool_executor: Arc<dyn ToolExecutor>,
    settings: &AgentSettings,
    events: mpsc::Sender<AgentEvent>,
    access_token: Option<String>,
) {
    let _ = events.send(AgentEvent::RunStarted).await;

    let mut messages = Vec::with_capacity(request.conversation_history.len() + 2);
    messages.push(Message::system(request.system_prompt.clone()));
    messages.extend(request.conversation_history.clone());
    messages.push(Message::user(request.user_message.clone()));

    let tool_choice = if request.tools.is_empty() {
        ToolChoiceMode::None
    } else {
        ToolChoiceMode::Auto
    };

    for iteration in 1..=settings.max_iterations {
        let _ = events.send(AgentEvent::IterationStarted { iteration }).await;
        let _ = events.send(AgentEvent::LlmRequestStarted { iteration }).await;

        let message_id = uuid::Uuid::new_v4().to_string();
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Chunk>(64);

        let llm_fut = llm.chat_stream(&messages, &request.tools, tool_choice, chunk_tx);

        let mut accum_text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut pending: std::collections::HashMap<String, (String, String)> = std::collections::HashMap::new();

        let drain_events = events.clone();
        let drain_message_id = message_id.clone();
        let drain = async {
            while let Some(chunk) = chunk_rx.recv().await {
                if let Some(text) = chunk.text {
                    accum_text.push_str(&text);
                    let _ = drain_events
                        .send(AgentEvent::LlmResponseChunk {
                            iteration,
                            message_id: drain_message_id.clone(),
                            text,
                        })
                        .await;
                }
                if let Some(delta) = chunk.tool_call {
                    let entry = pending.entry(delta.call_id.clone()).or_insert_with(|| (delta.name.clone(), String::new()));
                    if !delta.name.is_empty() {
                        entry.0 = delta.name;
                    }
                    entry.1.push_str(&delta.arguments_delta);
                }
            }
            (accum_text, pending)
        };

        let (llm_result, (final_text, pending)) = tokio::join!(llm_fut, drain);

        if let Err(e) = llm_result {
            handle_llm_error(e, iteration, &events).await;
            return;
        }

        for (call_id, (name, arguments_json)) in pending {
            let arguments = serde_json::from_str(&arguments_json).unwrap_or(Value::Null);
            tool_calls.push(ToolCall { call_id, name, arguments });
        }

        let _ = events
            .send(AgentEvent::LlmResponseCompleted {
                iteration,
                message_id: message_id.clone(),
                content: final_text.clone(),
            })
            .await;

        if tool_calls.is_empty() {
            let _ = events.send(AgentEvent::RunCompleted { content: final_text }).await;
            return;
        }

        let capped: Vec<ToolCall> = tool_calls
            .into_iter()
            .take(settings.max_tool_calls_per_iteration as usize)
            .collect();

        let _ = events
            .send(AgentEvent::ToolCallsDetected {
                iteration,
                calls: capped.clone(),
            })
            .await;

        messages.push(Message::assistant(final_text, capped.clone()));

        for call in capped {
            let terminate = execute_one_tool_call(
                &call,
                &*tool_executor,
                iteration,
                settings,
                &events,
                &mut messages,
                access_token.as_deref(),
            )
            .await;
            if terminate {
                return;
            }
        }

        let _ = events.send(AgentEvent::IterationCompleted { iteration }).await;
    }

    let _ = events
        .send(AgentEvent::RunFailed {
            reason: "max_iterations_exceeded".to_string(),
        })
        .await;
}

/// Executes one tool call with the configured retry policy. Returns `true` if
/// the run should terminate now (`stop_on_error` tripped).
async fn execute_one_tool_call(
    call: &ToolCall,
    tool_executor: &dyn ToolExecutor,
    iteration: u32,
    settings: &AgentSettings,
    events: &mpsc::Sender<AgentEvent>,
    messages: &mut Vec<Message>,
    access_token: Option<&str>,
) -> bool {
    let _ = events
        .send(AgentEvent::ToolExecutionStarted {
            iteration,
            call: call.clone(),
        })
        .await;

    let mut retries_left = settings.max_retries;
    let mut result = tool_executor
        .execute(&call.name, call.arguments.clone(), access_token)
        .await;

    while !result.success && settings.retry_on_error && retries_left > 0 {
        retries_left -= 1;
        result = tool_executor
            .execute(&call.name, call.arguments.clone(), access_token)
            .await;
    }

    if result.success {
        let _ = events
            .send(AgentEvent::ToolExecutionCompleted {
                iteration,
                call_id: call.call_id.clone(),
                result: result.result.clone().unwrap_or(Value::Null),
            })
            .await;
        let content = serde_json::to_string(&result.result.unwrap_or(Value::Null)).unwrap_or_default();
        messages.push(Message::tool(call.call_id.clone(), call.name.clone(), content));
        false
    } else {
        let error = result.error.clone().unwrap_or_else(|| "tool execution failed".to_string());
        let _ = events
            .send(AgentEvent::ToolExecutionFailed {
                iteration,
                call_id: call.call_id.clone(),
                error: error.clone(),
            })
            .await;
        messages.push(Message::tool(call.call_id.clone(), call.name.clone(), format!("error: {error}")));

        if settings.stop_on_error {
            let _ = events.send(AgentEvent::RunFailed { reason: error }).await;
            return true;
        }
        false
    }
}

async fn handle_llm_error(error: LlmError, iteration: u32, events: &mpsc::Sender<AgentEvent>) {
    tracing::warn!(iteration, error = %error, "llm call failed during agent run");
    let _ = events
        .send(AgentEvent::RunFailed {
            reason: error.to_string(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::tool_exec::MockToolExecutor;

    fn settings() -> AgentSettings {
        AgentSettings {
            max_iterations: 3,
            max_tool_calls_per_iteration: 5,
            timeout: Duration::from_secs(5),
            stop_on_error: false,
            retry_on_error: true,
            max_retries: 1,
        }
    }

    #[tokio::test]
    async fn no_tool_calls_completes_on_first_iteration() {
        let llm = Arc::new(MockLlm::new("final answer"));
        let tool_executor = Arc::new(MockToolExecutor::always_fail());
        let (tx, mut rx) = mpsc::channel(256);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        run_stream(
            RunRequest {
                user_message: "hi".into(),
                conversation_history: vec![],
                system_prompt: "you are a bot".into(),
                tools: vec![],
                access_token: None,
            },
            llm,
            tool_executor,
            settings(),
            tx,
            cancel_rx,
        )
        .await;

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert!(matches!(events.first(), Some(AgentEvent::RunStarted)));
        assert!(matches!(events.last(), Some(AgentEvent::RunCompleted { .. })));
    }
}
