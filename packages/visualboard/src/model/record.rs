use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cast::CastStore;
use super::scenario::ScenarioKey;
use super::story::StoryState;
use super::turn::TurnId;

/// Durable checkpoint of the latest analysis outcome for one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSuccessRecord {
    pub scenario_key: ScenarioKey,
    pub turn_id: TurnId,
    pub state: Option<StoryState>,
    #[serde(default)]
    pub cast: CastStore,
    pub saved_at: i64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl LastSuccessRecord {
    pub fn success(
        scenario_key: ScenarioKey,
        turn_id: TurnId,
        state: StoryState,
        cast: CastStore,
        saved_at: i64,
    ) -> Self {
        Self {
            scenario_key,
            turn_id,
            state: Some(state),
            cast,
            saved_at,
            last_error: None,
        }
    }

    /// Failure for `turn_id`. State and cast of `previous` survive; a record
    /// for the same turn only gets its error and timestamp refreshed.
    pub fn failure(
        previous: Option<LastSuccessRecord>,
        scenario_key: ScenarioKey,
        turn_id: TurnId,
        cast: CastStore,
        error: String,
        saved_at: i64,
    ) -> Self {
        match previous {
            Some(mut prev) if prev.turn_id == turn_id => {
                prev.last_error = Some(error);
                prev.saved_at = saved_at;
                prev
            }
            prev => Self {
                scenario_key,
                turn_id,
                state: prev.and_then(|p| p.state),
                cast,
                saved_at,
                last_error: Some(error),
            },
        }
    }

    pub fn has_error(&self) -> bool {
        self.last_error.as_deref().map(|e| !e.is_empty()).unwrap_or(false)
    }

    /// Parse a stored value, upgrading old shapes. Returns the record and
    /// whether it was migrated (and so should be written back).
    pub fn from_stored(value: Value) -> Option<(Self, bool)> {
        let Value::Object(mut obj) = value else {
            return None;
        };

        let mut migrated = false;
        let missing_saved_at = obj.get("savedAt").map(Value::is_null).unwrap_or(true);
        if missing_saved_at {
            if let Some(ts) = obj.get("timestamp").cloned().filter(|v| v.is_number()) {
                obj.insert("savedAt".to_string(), ts);
                migrated = true;
            } else {
                obj.insert("savedAt".to_string(), Value::from(0));
            }
        }

        let state = match obj.remove("state") {
            None | Some(Value::Null) => None,
            Some(raw) => match StoryState::from_value(raw) {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::warn!("Stored record state unreadable: {}", e);
                    None
                }
            },
        };

        if let Some(cast) = obj.remove("cast") {
            let cast = CastStore::from_stored(cast).unwrap_or_default();
            obj.insert(
                "cast".to_string(),
                serde_json::to_value(cast).unwrap_or(Value::Null),
            );
        }

        let mut record: LastSuccessRecord = match serde_json::from_value(Value::Object(obj)) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Failed to load last success record: {}", e);
                return None;
            }
        };
        record.state = state;
        Some((record, migrated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_timestamp_migrates_to_saved_at() {
        let stored = json!({
            "scenarioKey": "https://rofan.ai/chat/a",
            "turnId": "5:hello",
            "state": null,
            "timestamp": 1234
        });

        let (record, migrated) = LastSuccessRecord::from_stored(stored).unwrap();
        assert!(migrated);
        assert_eq!(record.saved_at, 1234);
        assert!(record.cast.is_v2());
        assert!(!record.has_error());
    }

    #[test]
    fn legacy_state_in_record_is_upgraded() {
        let stored = json!({
            "scenarioKey": "k",
            "turnId": "t",
            "state": {"scene": {"summary": "x"}, "characters": []},
            "savedAt": 5,
            "lastError": null
        });
        let (record, migrated) = LastSuccessRecord::from_stored(stored).unwrap();
        assert!(!migrated);
        assert_eq!(record.state.unwrap().scenes.len(), 1);
    }

    #[test]
    fn stored_state_with_null_fields_is_kept() {
        let stored = json!({
            "scenarioKey": "k",
            "turnId": "t",
            "state": {
                "scenes": [{"summary": null, "characters": [{"name": "Knight"}]}],
                "activeSceneIndex": null
            },
            "savedAt": 5
        });
        let (record, _) = LastSuccessRecord::from_stored(stored).unwrap();
        let state = record.state.unwrap();
        assert_eq!(state.active_scene_index, 0);
        assert_eq!(state.scenes[0].characters[0].name, "Knight");
    }

    #[test]
    fn failure_keeps_previous_state() {
        let state = StoryState::from_value(json!({"scene": {}, "characters": []})).unwrap();
        let prev = LastSuccessRecord::success(
            ScenarioKey::new("k"),
            TurnId::new("old"),
            state.clone(),
            CastStore::default(),
            1,
        );

        let failed = LastSuccessRecord::failure(
            Some(prev.clone()),
            ScenarioKey::new("k"),
            TurnId::new("new"),
            CastStore::default(),
            "API error: 500".to_string(),
            2,
        );
        assert_eq!(failed.turn_id, TurnId::new("new"));
        assert_eq!(failed.state, Some(state));
        assert_eq!(failed.last_error.as_deref(), Some("API error: 500"));

        let same_turn = LastSuccessRecord::failure(
            Some(prev),
            ScenarioKey::new("k"),
            TurnId::new("old"),
            CastStore::default(),
            "boom".to_string(),
            3,
        );
        assert_eq!(same_turn.turn_id, TurnId::new("old"));
        assert_eq!(same_turn.saved_at, 3);
        assert!(same_turn.has_error());
    }
}
