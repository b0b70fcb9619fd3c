//! `system.*` plane: connection lifecycle (spec §4.1, §4.6).

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ping {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pong {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionResume {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    #[serde(default, rename = "lastMessageId")]
    pub last_message_id: Option<String>,
    #[serde(default, rename = "lastItemIndex")]
    pub last_item_index: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionResumed {
    #[serde(rename = "stateValid")]
    pub state_valid: bool,
    #[serde(rename = "currentItemIndex")]
    pub current_item_index: u32,
    #[serde(rename = "missedMessages")]
    pub missed_messages: u32,
}

/// The `category` field of a `system.error` frame (spec §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Authentication,
    Authorization,
    RateLimit,
    Business,
    Server,
    Upstream,
}

/// A closed set of stable error codes. New failure modes should extend this
/// enum rather than carry a bare string, so clients can switch on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnknownMessageType,
    InvalidPayload,
    UnauthenticatedSignature,
    UnauthenticatedExpired,
    UnauthenticatedIssuer,
    UnauthenticatedAudience,
    UnauthenticatedMalformed,
    AccessDenied,
    RateLimitExceeded,
    InvalidState,
    ItemLoadFailed,
    MessageError,
    HandlerError,
    UpstreamUnavailable,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemError {
    pub category: ErrorCategory,
    pub code: ErrorCode,
    pub message: String,
    #[serde(rename = "isRetryable")]
    pub is_retryable: bool,
    #[serde(default, rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, rename = "validationErrors", skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
}

impl SystemError {
    pub fn new(category: ErrorCategory, code: ErrorCode, message: impl Into<String>, is_retryable: bool) -> Self {
        Self {
            category,
            code,
            message: message.into(),
            is_retryable,
            retry_after_ms: None,
            validation_errors: Vec::new(),
        }
    }

    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn with_validation_errors(mut self, errors: Vec<String>) -> Self {
        self.validation_errors = errors;
        self
    }
}
