//! The LLM provider interface consumed by [`crate::template`] and [`crate::agent`]
//! (spec §6).

mod http;
mod mock;

pub use http::HttpLlmClient;
pub use mock::MockLlm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::Message;

/// A tool definition exposed to the model, using a JSON-Schema subset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// How the model should treat the offered tools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolChoiceMode {
    Auto,
    None,
    Required,
}

impl std::str::FromStr for ToolChoiceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "none" => Ok(Self::None),
            "required" => Ok(Self::Required),
            other => Err(format!("unknown tool choice mode: {other}")),
        }
    }
}

/// A tool call requested by the model, accumulated across `invoke_stream` deltas.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub call_id: String,
    pub name: String,
    pub arguments_delta: String,
}

/// One chunk of a streamed model response: either text, a tool-call delta, or both.
#[derive(Clone, Debug, Default)]
pub struct Chunk {
    pub text: Option<String>,
    pub tool_call: Option<ToolCallDelta>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A complete (non-streamed) model response.
#[derive(Clone, Debug, Default)]
pub struct LlmResponse {
    pub content: String,
    pub usage: LlmUsage,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm returned an unparseable response: {0}")]
    Malformed(String),
    #[error("llm error: {0}")]
    Other(String),
}

/// Abstraction over the LLM provider. Implementations talk to whatever backend is
/// configured; the core only ever sees this trait.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Non-streaming call, used by the template runner for templated-content
    /// generation and scoring (no tool loop, no history beyond what's passed in).
    async fn chat(&self, messages: &[Message]) -> Result<LlmResponse, LlmError>;

    /// Streaming call used by the agent loop. Chunks are pushed onto `sender` as
    /// they arrive; the returned `LlmResponse` carries the accumulated text and
    /// usage once the stream ends. `tools` may be empty to disable tool calling.
    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        tool_choice: ToolChoiceMode,
        sender: mpsc::Sender<Chunk>,
    ) -> Result<LlmResponse, LlmError>;
}
