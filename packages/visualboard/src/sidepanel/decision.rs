//! The skip / restore / retry / analyze table, as a pure function.

use crate::model::{LastSuccessRecord, TurnId};

/// What produced the candidate turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// `NEW_LAST_AI_TURN` push with auto-update on
    Auto,
    /// The analyze button
    Manual,
    /// Selection-mode text
    Selection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub kind: TriggerKind,
    /// Skip the table and analyze
    pub force: bool,
}

impl Trigger {
    pub fn auto() -> Self {
        Self {
            kind: TriggerKind::Auto,
            force: false,
        }
    }

    pub fn manual(force: bool) -> Self {
        Self {
            kind: TriggerKind::Manual,
            force,
        }
    }

    pub fn selection() -> Self {
        Self {
            kind: TriggerKind::Selection,
            force: false,
        }
    }

    pub fn is_automatic(&self) -> bool {
        self.kind == TriggerKind::Auto && !self.force
    }
}

/// Board side of the state triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardState {
    Empty,
    Populated { turn_id: Option<TurnId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Push the cached state and adopt it, no remote call
    Restore,
    /// Already showing this turn
    Skip,
    /// Same turn as the cached record, which failed last time
    Retry,
    Analyze,
}

impl Action {
    pub fn calls_remote(&self) -> bool {
        matches!(self, Action::Retry | Action::Analyze)
    }
}

/// First match wins, unless `force` sends everything to `Analyze`.
pub fn decide(
    trigger: &Trigger,
    board: &BoardState,
    turn_id: &TurnId,
    record: Option<&LastSuccessRecord>,
) -> Action {
    if trigger.force {
        return Action::Analyze;
    }
    let Some(record) = record.filter(|r| &r.turn_id == turn_id) else {
        return Action::Analyze;
    };

    match board {
        BoardState::Empty if !record.has_error() && record.state.is_some() => {
            return Action::Restore;
        }
        BoardState::Populated { turn_id: current }
            if trigger.is_automatic()
                && !record.has_error()
                && current.as_ref() == Some(turn_id) =>
        {
            return Action::Skip;
        }
        _ => {}
    }

    if record.has_error() {
        Action::Retry
    } else {
        Action::Analyze
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CastStore, ScenarioKey, StoryState};
    use serde_json::json;

    fn record(turn: &str, error: Option<&str>) -> LastSuccessRecord {
        LastSuccessRecord {
            scenario_key: ScenarioKey::new("k"),
            turn_id: TurnId::new(turn),
            state: Some(StoryState::from_value(json!({"scenes": [{"summary": "s"}]})).unwrap()),
            cast: CastStore::default(),
            saved_at: 1,
            last_error: error.map(str::to_string),
        }
    }

    fn populated(turn: &str) -> BoardState {
        BoardState::Populated {
            turn_id: Some(TurnId::new(turn)),
        }
    }

    #[test]
    fn empty_board_restores_matching_clean_record() {
        let t = TurnId::new("T");
        let r = record("T", None);
        assert_eq!(decide(&Trigger::auto(), &BoardState::Empty, &t, Some(&r)), Action::Restore);
        assert_eq!(
            decide(&Trigger::manual(false), &BoardState::Empty, &t, Some(&r)),
            Action::Restore
        );
    }

    #[test]
    fn record_without_state_cannot_restore() {
        let t = TurnId::new("T");
        let mut r = record("T", None);
        r.state = None;
        assert_eq!(decide(&Trigger::auto(), &BoardState::Empty, &t, Some(&r)), Action::Analyze);
    }

    #[test]
    fn automatic_trigger_skips_turn_on_display() {
        let t = TurnId::new("T");
        let r = record("T", None);
        assert_eq!(decide(&Trigger::auto(), &populated("T"), &t, Some(&r)), Action::Skip);
        // A manual click is a "show me the latest" request.
        assert_eq!(
            decide(&Trigger::manual(false), &populated("T"), &t, Some(&r)),
            Action::Analyze
        );
        // Board shows something else.
        assert_eq!(decide(&Trigger::auto(), &populated("U"), &t, Some(&r)), Action::Analyze);
    }

    #[test]
    fn recorded_error_means_retry() {
        let t = TurnId::new("T");
        let r = record("T", Some("API error: 500"));
        assert_eq!(decide(&Trigger::auto(), &BoardState::Empty, &t, Some(&r)), Action::Retry);
        assert_eq!(decide(&Trigger::auto(), &populated("T"), &t, Some(&r)), Action::Retry);
    }

    #[test]
    fn force_and_new_turns_analyze() {
        let t = TurnId::new("T");
        let r = record("T", None);
        assert_eq!(
            decide(&Trigger::manual(true), &BoardState::Empty, &t, Some(&r)),
            Action::Analyze
        );
        assert_eq!(decide(&Trigger::auto(), &BoardState::Empty, &t, None), Action::Analyze);
        let other = record("old", None);
        assert_eq!(
            decide(&Trigger::auto(), &populated("old"), &t, Some(&other)),
            Action::Analyze
        );
    }
}
