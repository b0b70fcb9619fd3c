//! Invokes the remote tool service with a per-tool authorization token (C12,
//! spec §4.11).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{success, result?|error, executionTimeMs}` (spec §4.11).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl ToolExecutionResult {
    pub fn unavailable() -> Self {
        Self {
            success: false,
            result: None,
            error: Some("Tool execution not available".to_string()),
            execution_time_ms: 0,
        }
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// `user_access_token` is the per-tool authorization token forwarded as a
    /// bearer token. Transport errors (connect refused, timeout, 5xx) and an
    /// application-level `{success:false, error}` body are surfaced
    /// identically as a failed [`ToolExecutionResult`] (spec §4.11) — neither
    /// is a Rust `Err`, since a tool failure is a normal agent-loop outcome.
    async fn execute(&self, tool_name: &str, arguments: Value, user_access_token: Option<&str>) -> ToolExecutionResult;
}

/// POSTs to `/api/agent/tools/call` (spec §4.11, §6).
pub struct HttpToolExecutor {
    client: reqwest::Client,
    base_url: String,
    timeout: std::time::Duration,
}

impl HttpToolExecutor {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[derive(Serialize)]
struct ToolCallBody<'a> {
    name: &'a str,
    arguments: &'a Value,
}

#[derive(Deserialize)]
struct ToolCallResponse {
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn execute(&self, tool_name: &str, arguments: Value, user_access_token: Option<&str>) -> ToolExecutionResult {
        let Some(token) = user_access_token else {
            return ToolExecutionResult::unavailable();
        };

        let started = std::time::Instant::now();
        let url = format!("{}/api/agent/tools/call", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .json(&ToolCallBody {
                name: tool_name,
                arguments: &arguments,
            })
            .send()
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(tool = tool_name, error = %e, "tool call transport error");
                return ToolExecutionResult {
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                    execution_time_ms: elapsed_ms,
                };
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            return ToolExecutionResult {
                success: false,
                result: None,
                error: Some(format!("tool service returned {status}")),
                execution_time_ms: elapsed_ms,
            };
        }

        match response.json::<ToolCallResponse>().await {
            Ok(body) => ToolExecutionResult {
                success: body.success,
                result: body.result,
                error: body.error,
                execution_time_ms: elapsed_ms,
            },
            Err(e) => ToolExecutionResult {
                success: false,
                result: None,
                error: Some(format!("malformed tool service response: {e}")),
                execution_time_ms: elapsed_ms,
            },
        }
    }
}

/// A canned [`ToolExecutor`] for tests.
pub struct MockToolExecutor {
    succeed: bool,
    payload: Value,
}

impl MockToolExecutor {
    pub fn always_succeed(payload: Value) -> Self {
        Self { succeed: true, payload }
    }

    pub fn always_fail() -> Self {
        Self {
            succeed: false,
            payload: Value::Null,
        }
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    async fn execute(&self, _tool_name: &str, _arguments: Value, _user_access_token: Option<&str>) -> ToolExecutionResult {
        if self.succeed {
            ToolExecutionResult {
                success: true,
                result: Some(self.payload.clone()),
                error: None,
                execution_time_ms: 0,
            }
        } else {
            ToolExecutionResult {
                success: false,
                result: None,
                error: Some("mock failure".to_string()),
                execution_time_ms: 0,
            }
        }
    }
}
