//! A deterministic, canned-response [`LlmClient`], useful for tests and for running
//! the orchestrator without a configured model.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Chunk, LlmClient, LlmError, LlmResponse, LlmUsage, ToolChoiceMode, ToolDefinition};
use crate::message::Message;

/// Always answers with a fixed string, split into fixed-size chunks when streamed.
pub struct MockLlm {
    response: String,
    chunk_size: usize,
}

impl MockLlm {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            chunk_size: 16,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn chat(&self, _messages: &[Message]) -> Result<LlmResponse, LlmError> {
        Ok(LlmResponse {
            content: self.response.clone(),
            usage: LlmUsage::default(),
        })
    }

    async fn chat_stream(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
        _tool_choice: ToolChoiceMode,
        sender: mpsc::Sender<Chunk>,
    ) -> Result<LlmResponse, LlmError> {
        let bytes: Vec<char> = self.response.chars().collect();
        for piece in bytes.chunks(self.chunk_size) {
            let text: String = piece.iter().collect();
            if sender
                .send(Chunk {
                    text: Some(text),
                    tool_call: None,
                })
                .await
                .is_err()
            {
                break;
            }
        }
        Ok(LlmResponse {
            content: self.response.clone(),
            usage: LlmUsage::default(),
        })
    }
}
