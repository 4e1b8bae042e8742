//! Per-scenario character identity registry.
//!
//! Aliases are indexed in a normalized form (trimmed, lowercased, internal
//! whitespace collapsed). Pronouns and demonstratives are never indexed:
//! they refer to different people from one turn to the next.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::story::StoryState;

pub const CAST_STORE_VERSION: &str = "v2";

/// Gender recorded for identities nobody has described yet.
pub const UNKNOWN_GENDER: &str = "unknown";

const PRONOUNS_AND_DEMONSTRATIVES: &[&str] = &[
    "그", "그녀", "나", "너", "우리", "당신", "이 사람", "저 사람", "그쪽", "여기", "저기",
    "그것", "이것", "저것", "그녀석", "저자", "본인", "당신들", "그들", "그녀들", "그분", "이분",
    "저분", "그대", "이대", "저대",
];

pub fn normalize_alias(alias: &str) -> String {
    alias
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn is_pronoun_or_demonstrative(alias: &str) -> bool {
    let normalized = normalize_alias(alias);
    PRONOUNS_AND_DEMONSTRATIVES.contains(&normalized.as_str())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastEntry {
    pub id: String,
    #[serde(default)]
    pub canonical_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_ghost: Option<bool>,
    /// Board-side profile (gender, portrait, notes...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CastEntry {
    /// Fresh low-confidence identity for a name nobody matched.
    pub fn ghost(name: &str) -> Self {
        let trimmed = name.trim();
        let name = if trimmed.is_empty() { "Unknown" } else { trimmed };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            canonical_name: name.to_string(),
            aliases: vec![name.to_string()],
            gender: Some(UNKNOWN_GENDER.to_string()),
            is_ghost: Some(true),
            profile: None,
            extra: Map::new(),
        }
    }

    /// `gender`, else `profile.gender`, else unknown.
    pub fn resolved_gender(&self) -> String {
        self.gender
            .clone()
            .filter(|g| !g.is_empty())
            .or_else(|| {
                self.profile
                    .as_ref()
                    .and_then(|p| p.get("gender"))
                    .and_then(|g| g.as_str())
                    .filter(|g| !g.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| UNKNOWN_GENDER.to_string())
    }
}

/// Identity hint sent with an analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastHint {
    /// Omitted for hints that are not backed by a stored identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub canonical_name: String,
    pub aliases: Vec<String>,
    pub gender: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastStore {
    pub version: String,
    #[serde(default)]
    pub characters_by_id: BTreeMap<String, CastEntry>,
    #[serde(default)]
    pub alias_map: BTreeMap<String, String>,
}

impl Default for CastStore {
    fn default() -> Self {
        Self {
            version: CAST_STORE_VERSION.to_string(),
            characters_by_id: BTreeMap::new(),
            alias_map: BTreeMap::new(),
        }
    }
}

/// Outcome counters of one matching pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchReport {
    pub ghosts_created: usize,
    pub matched: usize,
}

impl CastStore {
    pub fn is_v2(&self) -> bool {
        self.version == CAST_STORE_VERSION
    }

    pub fn is_empty(&self) -> bool {
        self.characters_by_id.is_empty()
    }

    pub fn len(&self) -> usize {
        self.characters_by_id.len()
    }

    /// Load a stored value. Older versions come back as an empty v2 store;
    /// the board migrates them and syncs the result back.
    pub fn from_stored(value: Value) -> Option<Self> {
        let is_v2 = value.get("version").and_then(|v| v.as_str()) == Some(CAST_STORE_VERSION);
        if !is_v2 {
            return value.is_object().then(CastStore::default);
        }
        match serde_json::from_value(value) {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::warn!("Failed to parse cast store: {}", e);
                None
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&CastEntry> {
        self.characters_by_id.get(id)
    }

    /// Resolve a name through the alias index.
    pub fn lookup_alias(&self, name: &str) -> Option<&str> {
        let id = self.alias_map.get(&normalize_alias(name))?;
        self.characters_by_id
            .contains_key(id)
            .then_some(id.as_str())
    }

    /// Bind `alias → character_id`. Pronouns and empty aliases are dropped;
    /// conflicting bindings are overwritten. Returns whether the map changed.
    pub fn update_alias_map(&mut self, alias: &str, character_id: &str) -> bool {
        if character_id.is_empty() || is_pronoun_or_demonstrative(alias) {
            return false;
        }
        let normalized = normalize_alias(alias);
        if normalized.is_empty() {
            return false;
        }

        if let Some(existing) = self.alias_map.get(&normalized) {
            if existing == character_id {
                return false;
            }
            tracing::warn!(
                "aliasMap conflict: \"{}\" was {}, now {}",
                alias,
                existing,
                character_id
            );
        }
        self.alias_map.insert(normalized, character_id.to_string());
        true
    }

    fn insert_ghost(&mut self, name: &str) -> String {
        let ghost = CastEntry::ghost(name);
        let id = ghost.id.clone();
        self.characters_by_id.insert(id.clone(), ghost);
        self.update_alias_map(name, &id);
        id
    }

    /// Resolve every character reference of `state` to a stable identity and
    /// write the resolved id back into the reference.
    pub fn match_characters(&mut self, state: &mut StoryState) -> MatchReport {
        let mut report = MatchReport::default();

        for character in state.characters_mut() {
            if character.name.trim().is_empty() {
                continue;
            }

            if let Some(ref_id) = character.ref_id.clone().filter(|id| !id.is_empty()) {
                if self.characters_by_id.contains_key(&ref_id) {
                    self.update_alias_map(&character.name, &ref_id);
                    report.matched += 1;
                    continue;
                }
                tracing::warn!("refId not found in cast store: {}", ref_id);
                character.ref_id = Some(self.insert_ghost(&character.name));
                report.ghosts_created += 1;
                continue;
            }

            if character.is_new == Some(true) {
                character.ref_id = Some(self.insert_ghost(&character.name));
                report.ghosts_created += 1;
                continue;
            }

            match self.lookup_alias(&character.name).map(str::to_string) {
                Some(id) => {
                    self.update_alias_map(&character.name, &id);
                    character.ref_id = Some(id);
                    report.matched += 1;
                }
                None => {
                    character.ref_id = Some(self.insert_ghost(&character.name));
                    report.ghosts_created += 1;
                }
            }
        }

        if report.ghosts_created > 0 || report.matched > 0 {
            tracing::info!(
                ghost_created = report.ghosts_created,
                matched = report.matched,
                "Character matching completed"
            );
        }
        report
    }

    /// Hints for every stored identity, pronoun aliases removed.
    pub fn cast_hints(&self) -> Vec<CastHint> {
        let hints: Vec<CastHint> = self
            .characters_by_id
            .iter()
            .map(|(id, entry)| CastHint {
                id: Some(if entry.id.is_empty() { id.clone() } else { entry.id.clone() }),
                canonical_name: entry.canonical_name.clone(),
                aliases: entry
                    .aliases
                    .iter()
                    .filter(|a| !is_pronoun_or_demonstrative(a))
                    .cloned()
                    .collect(),
                gender: entry.resolved_gender(),
            })
            .collect();

        if !hints.is_empty() {
            let names: Vec<&str> = hints
                .iter()
                .take(10)
                .map(|h| h.canonical_name.as_str())
                .collect();
            tracing::debug!(count = hints.len(), ?names, "castHints generated");
        }
        hints
    }
}

/// Best-effort hints pulled from the names in a previous board state. They
/// carry no id so the analyzer cannot mistake them for stored identities.
pub fn hints_from_previous_state(state: &StoryState) -> Vec<CastHint> {
    let mut seen = HashSet::new();
    state
        .characters()
        .filter_map(|c| {
            let name = c.name.trim();
            if name.is_empty() || is_pronoun_or_demonstrative(name) || !seen.insert(name.to_string())
            {
                return None;
            }
            Some(CastHint {
                id: None,
                canonical_name: name.to_string(),
                aliases: vec![name.to_string()],
                gender: UNKNOWN_GENDER.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::story::{CharacterRef, StoryState};
    use serde_json::json;

    fn state_with(characters: Vec<CharacterRef>) -> StoryState {
        let mut state = StoryState::from_value(json!({
            "scenes": [{"summary": "s", "type": "room", "characters": [], "dialogue_impact": "low"}]
        }))
        .unwrap();
        state.scenes[0].characters = characters;
        state
    }

    fn store_with(name: &str) -> (CastStore, String) {
        let mut store = CastStore::default();
        let id = store.insert_ghost(name);
        (store, id)
    }

    #[test]
    fn normalize_alias_collapses_whitespace_and_case() {
        assert_eq!(normalize_alias("  Sir   Lancelot\tDu Lac "), "sir lancelot du lac");
        assert_eq!(normalize_alias("   "), "");
    }

    #[test]
    fn pronouns_never_enter_alias_map() {
        let (mut store, id) = store_with("Knight");
        let before = store.alias_map.clone();

        for pronoun in PRONOUNS_AND_DEMONSTRATIVES {
            assert!(!store.update_alias_map(pronoun, &id));
        }
        assert!(!store.update_alias_map(" 그녀 ", &id));
        assert!(!store.update_alias_map("", &id));
        assert!(!store.update_alias_map("   ", &id));
        assert_eq!(store.alias_map, before);
    }

    #[test]
    fn nameless_references_are_skipped_by_matching() {
        let mut store = CastStore::default();
        let mut state = StoryState::from_value(json!({
            "scenes": [{"summary": "s", "characters": [{"isNew": true}, {"name": null}]}]
        }))
        .unwrap();

        let report = store.match_characters(&mut state);
        assert_eq!(report.ghosts_created, 0);
        assert!(store.is_empty());
        assert!(state.characters().all(|c| c.ref_id.is_none()));
    }

    #[test]
    fn alias_conflict_is_last_write_wins() {
        let mut store = CastStore::default();
        let a = store.insert_ghost("Alice");
        let b = store.insert_ghost("Bob");

        assert!(store.update_alias_map("The Heir", &a));
        assert!(store.update_alias_map("the  heir", &b));
        assert_eq!(store.alias_map.get("the heir"), Some(&b));
        assert!(!store.update_alias_map("The Heir", &b));
    }

    #[test]
    fn new_character_becomes_ghost() {
        let mut store = CastStore::default();
        let mut knight = CharacterRef::named("  Knight ");
        knight.is_new = Some(true);
        let mut state = state_with(vec![knight]);

        let report = store.match_characters(&mut state);

        assert_eq!(report.ghosts_created, 1);
        let id = state.scenes[0].characters[0].ref_id.clone().unwrap();
        let ghost = store.get(&id).unwrap();
        assert_eq!(ghost.is_ghost, Some(true));
        assert_eq!(ghost.gender.as_deref(), Some("unknown"));
        assert_eq!(ghost.aliases, vec!["Knight".to_string()]);
        assert_eq!(store.alias_map.get("knight"), Some(&id));
    }

    #[test]
    fn known_ref_id_is_reused_and_indexed() {
        let (mut store, id) = store_with("Arthur");
        let mut king = CharacterRef::named("The King");
        king.ref_id = Some(id.clone());
        let mut state = state_with(vec![king]);

        let report = store.match_characters(&mut state);

        assert_eq!(report, MatchReport { ghosts_created: 0, matched: 1 });
        assert_eq!(store.len(), 1);
        assert_eq!(store.alias_map.get("the king"), Some(&id));
    }

    #[test]
    fn unknown_ref_id_falls_back_to_ghost() {
        let mut store = CastStore::default();
        let mut stranger = CharacterRef::named("Stranger");
        stranger.ref_id = Some("missing".to_string());
        let mut state = state_with(vec![stranger]);

        let report = store.match_characters(&mut state);

        assert_eq!(report.ghosts_created, 1);
        let id = state.scenes[0].characters[0].ref_id.clone().unwrap();
        assert_ne!(id, "missing");
        assert!(store.get(&id).is_some());
    }

    #[test]
    fn alias_hit_reuses_identity() {
        let (mut store, id) = store_with("Merlin");
        let mut state = state_with(vec![CharacterRef::named("MERLIN")]);

        let report = store.match_characters(&mut state);

        assert_eq!(report.matched, 1);
        assert_eq!(state.scenes[0].characters[0].ref_id.as_deref(), Some(id.as_str()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn every_alias_points_at_a_stored_identity() {
        let mut store = CastStore::default();
        let mut state = state_with(vec![
            CharacterRef::named("A"),
            CharacterRef::named("B"),
            CharacterRef::named("a"),
        ]);
        store.match_characters(&mut state);

        assert_eq!(store.len(), 2);
        for id in store.alias_map.values() {
            assert!(store.characters_by_id.contains_key(id));
        }
    }

    #[test]
    fn hints_filter_pronouns_and_resolve_gender() {
        let mut store = CastStore::default();
        let id = store.insert_ghost("Elena");
        let entry = store.characters_by_id.get_mut(&id).unwrap();
        entry.aliases.push("그녀".to_string());
        entry.gender = None;
        entry.profile = Some(json!({"gender": "female"}));

        let hints = store.cast_hints();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].id.as_deref(), Some(id.as_str()));
        assert_eq!(hints[0].aliases, vec!["Elena".to_string()]);
        assert_eq!(hints[0].gender, "female");
    }

    #[test]
    fn previous_state_hints_have_no_id() {
        let state = state_with(vec![
            CharacterRef::named("Knight"),
            CharacterRef::named("Knight"),
            CharacterRef::named("그"),
            CharacterRef::named(" "),
        ]);
        let hints = hints_from_previous_state(&state);
        assert_eq!(hints.len(), 1);
        assert!(hints[0].id.is_none());
        let json = serde_json::to_value(&hints[0]).unwrap();
        assert!(json.get("id").is_none());
    }

    #[test]
    fn non_v2_store_loads_empty() {
        let store = CastStore::from_stored(json!({"characters": {"x": {}}})).unwrap();
        assert!(store.is_v2());
        assert!(store.is_empty());
        assert!(CastStore::from_stored(json!(null)).is_none());
    }
}
