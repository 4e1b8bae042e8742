//! Internal extension messaging: Content Bridge <-> Background Router <->
//! Side Panel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::ScenarioKey;

/// The only provider this build handles.
pub const PROVIDER_ROFAN_AI: &str = "rofan-ai";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeMessage {
    RequestLastAiMessage(LastAiMessageRequest),
    NewLastAiTurn(NewTurn),
    AutoUpdateError(AutoUpdateError),
    TextSelected(TextSelected),
    EnvChanged(EnvChanged),
}

impl RuntimeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeMessage::RequestLastAiMessage(_) => "REQUEST_LAST_AI_MESSAGE",
            RuntimeMessage::NewLastAiTurn(_) => "NEW_LAST_AI_TURN",
            RuntimeMessage::AutoUpdateError(_) => "AUTO_UPDATE_ERROR",
            RuntimeMessage::TextSelected(_) => "TEXT_SELECTED",
            RuntimeMessage::EnvChanged(_) => "ENV_CHANGED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastAiMessageRequest {
    pub provider: String,
}

/// A detected turn. The first hop (content -> background) carries no
/// source ids; the re-broadcast carries both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTurn {
    pub provider: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub scenario_key: Option<ScenarioKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_tab_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_window_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoUpdateError {
    pub provider: String,
    pub reason: FailureReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSelected {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvChanged {
    pub server_env: String,
}

/// Typed failure reasons carried by `{ success: false, reason }` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NotRofanChatPage,
    UnsupportedProvider,
    NotFound,
    NoActiveRofanChatTab,
    ForwardError,
    ForwardErrorAfterInjection,
    InjectionFailed,
    UnexpectedError,
    ContextInvalidated,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NotRofanChatPage => "not_rofan_chat_page",
            FailureReason::UnsupportedProvider => "unsupported_provider",
            FailureReason::NotFound => "not_found",
            FailureReason::NoActiveRofanChatTab => "no_active_rofan_chat_tab",
            FailureReason::ForwardError => "forward_error",
            FailureReason::ForwardErrorAfterInjection => "forward_error_after_injection",
            FailureReason::InjectionFailed => "injection_failed",
            FailureReason::UnexpectedError => "unexpected_error",
            FailureReason::ContextInvalidated => "context_invalidated",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the DOM Extractor found its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    Dom,
    Store,
    FirstMessage,
    DomFirst,
}

/// Reply to `REQUEST_LAST_AI_MESSAGE`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastAiMessageResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_key: Option<ScenarioKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ExtractionSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LastAiMessageResponse {
    pub fn failure(reason: FailureReason) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            ..Default::default()
        }
    }

    pub fn failure_with_error(reason: FailureReason, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::failure(reason)
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Non-empty text of a successful reply.
    pub fn usable_text(&self) -> Option<&str> {
        if !self.success {
            return None;
        }
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// Tab a runtime message came from, as the router sees it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageSender {
    pub tab_id: Option<i64>,
    pub window_id: Option<i64>,
}

/// A message pushed by a content script, tagged with its tab.
#[derive(Debug, Clone, PartialEq)]
pub struct TabMessage {
    pub sender: MessageSender,
    pub message: RuntimeMessage,
}

/// What the Side Panel needs from the privileged side of the extension.
#[async_trait]
pub trait RouterLink: Send + Sync {
    /// Ask the active chat tab for its latest turn.
    async fn request_last_ai_message(&self, provider: &str) -> Result<LastAiMessageResponse>;

    /// URL of the active tab in the last focused window, if any.
    async fn active_tab_url(&self) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_use_type_tags() {
        let msg = RuntimeMessage::NewLastAiTurn(NewTurn {
            provider: PROVIDER_ROFAN_AI.to_string(),
            text: "hi".to_string(),
            user_text: None,
            ai_text: Some("hi".to_string()),
            chat_id: None,
            scenario_key: Some(ScenarioKey::new("https://rofan.ai/chat/a")),
            source_tab_id: Some(3),
            source_window_id: Some(1),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "NEW_LAST_AI_TURN");
        assert_eq!(value["sourceWindowId"], 1);
        assert_eq!(value["scenarioKey"], "https://rofan.ai/chat/a");

        let parsed: RuntimeMessage =
            serde_json::from_value(json!({"type": "ENV_CHANGED", "server_env": "dev"})).unwrap();
        assert_eq!(
            parsed,
            RuntimeMessage::EnvChanged(EnvChanged {
                server_env: "dev".to_string()
            })
        );
    }

    #[test]
    fn failure_reply_carries_snake_case_reason() {
        let reply = LastAiMessageResponse::failure_with_error(
            FailureReason::ForwardErrorAfterInjection,
            "Receiving end does not exist.",
        );
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["reason"], "forward_error_after_injection");
        assert!(reply.usable_text().is_none());
    }
}
