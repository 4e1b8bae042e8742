//! Side Panel Controller: the window-scoped state machine that decides, per
//! candidate turn, whether to skip, restore from cache or analyze, and keeps
//! the board iframe, the cast store and the last-success record consistent.

pub mod analysis;
pub mod controller;
pub mod decision;
pub mod frame;
pub mod session;

pub use analysis::{AnalysisErrorCode, AnalysisRequest, AnalysisService, HttpAnalysisClient};
pub use controller::{PanelSettings, SidePanelController, TurnInput, TurnOutcome};
pub use decision::{decide, Action, BoardState, Trigger, TriggerKind};
pub use frame::{BoardFrame, Inbound, PostOutcome, RecordingFrame};
pub use session::SidePanelSession;

pub const TOAST_RESTORED: &str = "보드가 복원되었습니다.";
pub const TOAST_UPDATED: &str = "보드가 업데이트되었습니다.";
pub const TOAST_FORCED: &str = "보드가 강제 재분석되었습니다.";
pub const TOAST_RESET: &str = "보드가 초기화되었습니다.";
pub const TOAST_SELECTION_FAILED: &str = "업데이트에 실패했습니다. 다시 시도해 주세요.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
}

/// Something the panel UI should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelNotice {
    Toast { level: NoticeLevel, message: String },
    /// Stays up until the user reloads the page.
    Persistent(String),
    /// The auto-update toggle was switched off.
    AutoUpdateDisabled(String),
}

impl PanelNotice {
    pub fn success(message: impl Into<String>) -> Self {
        PanelNotice::Toast {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        PanelNotice::Toast {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            PanelNotice::Toast { message, .. } => message,
            PanelNotice::Persistent(message) | PanelNotice::AutoUpdateDisabled(message) => message,
        }
    }
}
