//! Domain types shared by every extension context.

pub mod bot;
pub mod cast;
pub mod record;
pub mod scenario;
pub mod story;
pub mod turn;

pub use bot::{AnalysisBotContext, BotContext, BotMetadata, ChatUser};
pub use cast::{CastEntry, CastHint, CastStore, MatchReport};
pub use record::LastSuccessRecord;
pub use scenario::{ChatId, ChatSite, ScenarioKey};
pub use story::{CharacterRef, Scene, StoryState};
pub use turn::{calculate_turn_id, RawTurnLog, TurnId, TurnLogEntry};

/// Milliseconds since the Unix epoch, the unit every persisted timestamp uses.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
