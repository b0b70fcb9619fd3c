//! An OpenAI-compatible [`LlmClient`] (spec §6 `LlmProvider` interface).
//!
//! Talks to any `/chat/completions` endpoint that follows the OpenAI wire
//! shape (OpenAI itself, and most self-hosted/proxy-compatible providers).

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Chunk, LlmClient, LlmError, LlmResponse, LlmUsage, ToolCallDelta, ToolChoiceMode, ToolDefinition};
use crate::message::{Message, Role};

pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: std::time::Duration,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl Role {
    fn wire(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "tool_call_id")]
    tool_call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty", rename = "tool_calls")]
    tool_calls: Vec<WireToolCall<'a>>,
}

#[derive(Serialize)]
struct WireToolCall<'a> {
    id: &'a str,
    r#type: &'static str,
    function: WireFunctionCall<'a>,
}

#[derive(Serialize)]
struct WireFunctionCall<'a> {
    name: &'a str,
    arguments: String,
}

#[derive(Serialize)]
struct WireToolDef<'a> {
    r#type: &'static str,
    function: WireFunctionDef<'a>,
}

#[derive(Serialize)]
struct WireFunctionDef<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireToolDef<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
}

fn wire_messages(messages: &[Message]) -> Vec<WireMessage<'_>> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: m.role.wire(),
            content: &m.content,
            name: m.name.as_deref(),
            tool_call_id: m.tool_call_id.as_deref(),
            tool_calls: m
                .tool_calls
                .iter()
                .map(|c| WireToolCall {
                    id: &c.call_id,
                    r#type: "function",
                    function: WireFunctionCall {
                        name: &c.name,
                        arguments: c.arguments.to_string(),
                    },
                })
                .collect(),
        })
        .collect()
}

fn wire_tool_choice(mode: ToolChoiceMode) -> Option<&'static str> {
    match mode {
        ToolChoiceMode::Auto => Some("auto"),
        ToolChoiceMode::None => Some("none"),
        ToolChoiceMode::Required => Some("required"),
    }
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize, Default)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for LlmUsage {
    fn from(u: WireUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Deserialize)]
struct WireStreamChunk {
    choices: Vec<WireStreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireStreamChoice {
    delta: WireDelta,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireDeltaToolCall>,
}

#[derive(Deserialize)]
struct WireDeltaToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireDeltaFunction>,
}

#[derive(Deserialize, Default)]
struct WireDeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat(&self, messages: &[Message]) -> Result<LlmResponse, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages: wire_messages(messages),
            stream: false,
            tools: Vec::new(),
            tool_choice: None,
        };

        let response = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Transport(format!("llm provider returned {status}: {text}")));
        }

        let parsed: WireResponse = response.json().await.map_err(|e| LlmError::Malformed(e.to_string()))?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| LlmError::Malformed("no choices in response".to_string()))?;

        Ok(LlmResponse {
            content: choice.message.content.unwrap_or_default(),
            usage: parsed.usage.map(Into::into).unwrap_or_default(),
        })
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        tool_choice: ToolChoiceMode,
        sender: mpsc::Sender<Chunk>,
    ) -> Result<LlmResponse, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages: wire_messages(messages),
            stream: true,
            tools: tools
                .iter()
                .map(|t| WireToolDef {
                    r#type: "function",
                    function: WireFunctionDef {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.parameters,
                    },
                })
                .collect(),
            tool_choice: if tools.is_empty() { None } else { wire_tool_choice(tool_choice) },
        };

        let response = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Transport(format!("llm provider returned {status}: {text}")));
        }

        let mut content = String::new();
        let mut usage = LlmUsage::default();
        let mut buf = String::new();
        let mut byte_stream = response.bytes_stream();

        // Accumulated per tool-call index, since a provider may split one
        // function call's arguments across many deltas.
        let mut tool_call_ids: Vec<Option<String>> = Vec::new();
        let mut tool_call_names: Vec<Option<String>> = Vec::new();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| LlmError::Transport(e.to_string()))?;
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buf.find("\n\n") {
                let event: String = buf.drain(..pos + 2).collect();
                for line in event.lines() {
                    let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        continue;
                    }
                    let parsed: WireStreamChunk = match serde_json::from_str(data) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::debug!(error = %e, "skipping unparseable llm stream event");
                            continue;
                        }
                    };
                    if let Some(u) = parsed.usage {
                        usage = u.into();
                    }
                    let Some(choice) = parsed.choices.into_iter().next() else {
                        continue;
                    };
                    if let Some(text) = choice.delta.content {
                        content.push_str(&text);
                        if sender.send(Chunk { text: Some(text), tool_call: None }).await.is_err() {
                            return Ok(LlmResponse { content, usage });
                        }
                    }
                    for (index, call) in choice.delta.tool_calls.into_iter().enumerate() {
                        while tool_call_ids.len() <= index {
                            tool_call_ids.push(None);
                            tool_call_names.push(None);
                        }
                        if let Some(id) = call.id {
                            tool_call_ids[index] = Some(id);
                        }
                        let Some(function) = call.function else { continue };
                        if let Some(name) = function.name {
                            tool_call_names[index] = Some(name);
                        }
                        if let Some(arguments_delta) = function.arguments {
                            let delta = ToolCallDelta {
                                call_id: tool_call_ids[index].clone().unwrap_or_default(),
                                name: tool_call_names[index].clone().unwrap_or_default(),
                                arguments_delta,
                            };
                            if sender.send(Chunk { text: None, tool_call: Some(delta) }).await.is_err() {
                                return Ok(LlmResponse { content, usage });
                            }
                        }
                    }
                }
            }
        }

        Ok(LlmResponse { content, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_preserve_tool_call_id_for_tool_role() {
        let messages = vec![Message::tool("call-1", "lookup", "{\"n\":3}")];
        let wire = wire_messages(&messages);
        assert_eq!(wire[0].tool_call_id, Some("call-1"));
        assert_eq!(wire[0].role, "tool");
    }

    #[test]
    fn tool_choice_omitted_when_no_tools_offered() {
        assert_eq!(wire_tool_choice(ToolChoiceMode::Auto), Some("auto"));
    }
}
