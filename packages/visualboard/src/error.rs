use thiserror::Error;

use crate::sidepanel::analysis::AnalysisErrorCode;

/// Generic message shown when an analysis attempt fails for a reason the
/// user cannot act on.
pub const GENERIC_ANALYSIS_FAILURE: &str =
    "최근 턴 분석에 실패했습니다. 잠시 후 다시 시도해주세요.";

/// Notice shown when the extension was reloaded under a live page.
pub const CONTEXT_INVALIDATED_NOTICE: &str =
    "확장 프로그램이 업데이트되었습니다. 페이지를 새로고침해주세요.";

#[derive(Error, Debug)]
pub enum VisualboardError {
    #[error("Extension context invalidated")]
    ContextInvalidated,

    #[error("Message channel closed: {0}")]
    ChannelClosed(String),

    #[error("Cannot determine scenario key")]
    ScenarioKeyUnresolved,

    #[error("Chat text is empty")]
    EmptyText,

    #[error("Analysis failed ({code}): {message}")]
    Analysis {
        code: AnalysisErrorCode,
        message: String,
    },

    #[error("Invalid story state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Forward failed ({reason}): {message}")]
    Forward { reason: String, message: String },

    #[error("Board frame not ready")]
    FrameNotReady,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl VisualboardError {
    /// True when the privileged runtime handle is permanently gone.
    pub fn is_context_invalidated(&self) -> bool {
        match self {
            VisualboardError::ContextInvalidated => true,
            VisualboardError::ChannelClosed(msg) | VisualboardError::Other(msg) => {
                crate::runtime::is_context_invalidated_message(msg)
            }
            _ => false,
        }
    }

    /// Transient failures: the attempt is abandoned but the context keeps running.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, VisualboardError::ChannelClosed(_)) && !self.is_context_invalidated()
    }

    /// Friendly text for the panel's toast / inline error area.
    pub fn user_message(&self) -> String {
        match self {
            VisualboardError::Analysis { code, .. } => code.user_message().to_string(),
            VisualboardError::EmptyText => "텍스트가 비어있습니다.".to_string(),
            VisualboardError::ScenarioKeyUnresolved => "시나리오 키를 확인할 수 없습니다.".to_string(),
            VisualboardError::ContextInvalidated => CONTEXT_INVALIDATED_NOTICE.to_string(),
            _ => GENERIC_ANALYSIS_FAILURE.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VisualboardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_invalidated_is_detected_from_message_text() {
        let err = VisualboardError::ChannelClosed("Extension context invalidated.".to_string());
        assert!(err.is_context_invalidated());
        assert!(!err.is_channel_closed());

        let err = VisualboardError::ChannelClosed(
            "The message port closed before a response was received.".to_string(),
        );
        assert!(!err.is_context_invalidated());
        assert!(err.is_channel_closed());
    }

    #[test]
    fn analysis_errors_use_code_specific_messages() {
        let refusal = VisualboardError::Analysis {
            code: AnalysisErrorCode::ModelRefusal,
            message: "refused".to_string(),
        };
        let parse = VisualboardError::Analysis {
            code: AnalysisErrorCode::ParseError,
            message: "bad json".to_string(),
        };
        assert_ne!(refusal.user_message(), parse.user_message());
        assert_eq!(
            VisualboardError::Storage("quota".to_string()).user_message(),
            GENERIC_ANALYSIS_FAILURE
        );
    }
}
