//! The command taxonomy dispatched through the [`super::Mediator`] by the
//! orchestrator handlers (spec §6, not exhaustive).

use super::Request;

/// Identity context carried on every command that needs to authorize against
/// the owning user (spec §6).
#[derive(Clone, Debug)]
pub struct UserInfo {
    pub user_id: String,
    pub roles: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SendMessageCommand {
    pub conversation_id: String,
    pub content: String,
    pub user_info: UserInfo,
}

#[derive(Clone, Debug)]
pub struct SendMessageResult {
    pub assistant_message_id: String,
}

impl Request for SendMessageCommand {
    type Response = SendMessageResult;
}

#[derive(Clone, Debug)]
pub struct CompleteMessageCommand {
    pub conversation_id: String,
    pub message_id: String,
    pub content: String,
    pub user_info: UserInfo,
}

impl Request for CompleteMessageCommand {
    type Response = ();
}

#[derive(Clone, Debug)]
pub struct RecordItemResponseCommand {
    pub conversation_id: String,
    pub item_id: String,
    pub item_index: u32,
    pub responses: serde_json::Value,
    pub response_time_ms: u64,
    pub user_info: UserInfo,
}

impl Request for RecordItemResponseCommand {
    type Response = ();
}

#[derive(Clone, Debug)]
pub struct AdvanceTemplateCommand {
    pub conversation_id: String,
    pub user_info: UserInfo,
}

#[derive(Clone, Debug)]
pub struct AdvanceTemplateResult {
    pub next_item_index: u32,
    pub completed: bool,
}

impl Request for AdvanceTemplateCommand {
    type Response = AdvanceTemplateResult;
}

#[derive(Clone, Debug)]
pub struct CancelOperationCommand {
    pub conversation_id: String,
    pub user_info: UserInfo,
}

impl Request for CancelOperationCommand {
    type Response = ();
}

#[derive(Clone, Debug)]
pub struct PauseConversationCommand {
    pub conversation_id: String,
    pub user_info: UserInfo,
}

impl Request for PauseConversationCommand {
    type Response = ();
}

#[derive(Clone, Debug)]
pub struct ResumeConversationCommand {
    pub conversation_id: String,
    pub user_info: UserInfo,
}

impl Request for ResumeConversationCommand {
    type Response = ();
}
