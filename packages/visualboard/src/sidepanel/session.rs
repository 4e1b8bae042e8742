//! Window-scoped transient state of the Side Panel.
//!
//! Constructed on panel mount, reset on scenario change, dropped on unmount.
//! Fields are private; every change goes through a named transition.

use tokio::time::Instant;

use super::decision::BoardState;
use crate::model::{ScenarioKey, StoryState, TurnId};

#[derive(Debug, Default)]
pub struct SidePanelSession {
    scenario_key: Option<ScenarioKey>,
    story_state: Option<StoryState>,
    turn_id: Option<TurnId>,
    last_posted_fingerprint: Option<String>,
    last_post_at: Option<Instant>,
    post_counter: u64,
}

impl SidePanelSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scenario_key(&self) -> Option<&ScenarioKey> {
        self.scenario_key.as_ref()
    }

    pub fn story_state(&self) -> Option<&StoryState> {
        self.story_state.as_ref()
    }

    pub fn turn_id(&self) -> Option<&TurnId> {
        self.turn_id.as_ref()
    }

    pub fn board(&self) -> BoardState {
        match &self.story_state {
            None => BoardState::Empty,
            Some(_) => BoardState::Populated {
                turn_id: self.turn_id.clone(),
            },
        }
    }

    pub fn is_board_empty(&self) -> bool {
        self.story_state.is_none()
    }

    fn clear_turn_scope(&mut self) {
        self.story_state = None;
        self.turn_id = None;
        self.last_posted_fingerprint = None;
        self.last_post_at = None;
        self.post_counter = 0;
    }

    /// Switch to `next`. Turn-scoped state is dropped; durable caches are
    /// not touched. Returns true when the key actually changed.
    pub fn handle_scenario_change(&mut self, next: Option<&ScenarioKey>) -> bool {
        let Some(next) = next else {
            return false;
        };
        if self.scenario_key.as_ref() == Some(next) {
            return false;
        }
        tracing::info!(
            "Scenario changed: {} -> {}",
            self.scenario_key
                .as_ref()
                .map(|k| k.as_str())
                .unwrap_or("(none)"),
            next
        );
        self.clear_turn_scope();
        self.scenario_key = Some(next.clone());
        true
    }

    /// Make `state` the board for `turn_id` under `key`, after an analysis
    /// or a restore.
    pub fn adopt(&mut self, key: &ScenarioKey, turn_id: TurnId, state: StoryState) {
        self.scenario_key = Some(key.clone());
        self.turn_id = Some(turn_id);
        self.story_state = Some(state);
    }

    /// Iframe-originated state, taken as fact.
    pub fn absorb(&mut self, state: StoryState) {
        self.story_state = Some(state);
    }

    /// Explicit user reset: board and dedup state cleared, key kept.
    pub fn reset_board(&mut self) {
        self.clear_turn_scope();
    }

    pub fn last_posted_fingerprint(&self) -> Option<&str> {
        self.last_posted_fingerprint.as_deref()
    }

    pub fn last_post_at(&self) -> Option<Instant> {
        self.last_post_at
    }

    /// Bookkeeping for one outbound push. Returns the message id.
    pub fn record_post(&mut self, fingerprint: String, at: Instant, timestamp: i64) -> String {
        self.post_counter += 1;
        self.last_posted_fingerprint = Some(fingerprint);
        self.last_post_at = Some(at);
        format!("sidepanel-{}-{}", timestamp, self.post_counter)
    }
}
