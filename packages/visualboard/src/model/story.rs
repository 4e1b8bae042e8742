use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, VisualboardError};

/// A character mentioned in a scene. Unknown fields emitted by the analyzer
/// ride along untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterRef {
    /// Empty when the analyzer sent no usable name; matching skips those.
    #[serde(default, deserialize_with = "string_or_empty")]
    pub name: String,
    #[serde(default, deserialize_with = "string_or_none", skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    #[serde(default, deserialize_with = "bool_or_none", skip_serializing_if = "Option::is_none")]
    pub is_new: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CharacterRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ref_id: None,
            is_new: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default, deserialize_with = "string_or_empty")]
    pub summary: String,
    #[serde(rename = "type", default = "default_scene_type", deserialize_with = "scene_type_or_default")]
    pub scene_type: String,
    #[serde(default, deserialize_with = "string_or_none", skip_serializing_if = "Option::is_none")]
    pub location_name: Option<String>,
    #[serde(default, deserialize_with = "string_or_none", skip_serializing_if = "Option::is_none")]
    pub backdrop_style: Option<String>,
    #[serde(default, deserialize_with = "characters_or_empty")]
    pub characters: Vec<CharacterRef>,
    #[serde(default = "default_dialogue_impact", deserialize_with = "dialogue_impact_or_default")]
    pub dialogue_impact: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_scene_type() -> String {
    "room".to_string()
}

fn default_dialogue_impact() -> String {
    "medium".to_string()
}

// Analyzer output is loosely typed: `null` or a wrong type reads as absent.

fn string_or_none<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

fn string_or_empty<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<String, D::Error> {
    Ok(string_or_none(de)?.unwrap_or_default())
}

fn bool_or_none<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<bool>, D::Error> {
    Ok(Value::deserialize(de)?.as_bool())
}

fn scene_type_or_default<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<String, D::Error> {
    Ok(string_or_none(de)?.unwrap_or_else(default_scene_type))
}

fn dialogue_impact_or_default<'de, D: Deserializer<'de>>(
    de: D,
) -> std::result::Result<String, D::Error> {
    Ok(string_or_none(de)?.unwrap_or_else(default_dialogue_impact))
}

/// Non-object entries are dropped; objects always parse.
fn characters_or_empty<'de, D: Deserializer<'de>>(
    de: D,
) -> std::result::Result<Vec<CharacterRef>, D::Error> {
    let Value::Array(items) = Value::deserialize(de)? else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

fn index_or_zero<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<usize, D::Error> {
    Ok(Value::deserialize(de)?
        .as_u64()
        .and_then(|i| usize::try_from(i).ok())
        .unwrap_or_default())
}

fn relations_or_empty<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Vec<Value>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Array(items) => items,
        _ => Vec::new(),
    })
}

/// The visual board's world state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryState {
    pub scenes: Vec<Scene>,
    #[serde(default, deserialize_with = "index_or_zero")]
    pub active_scene_index: usize,
    #[serde(default, deserialize_with = "relations_or_empty")]
    pub relations: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StoryState {
    /// Accept either the canonical `scenes[]` shape or the legacy single-scene
    /// `{ scene, characters, dialogue_impact }` shape and return the canonical
    /// form. Upgrading an already canonical value returns it unchanged.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            return Err(VisualboardError::InvalidState(
                "state is not an object".to_string(),
            ));
        };

        let scene_count = match obj.get("scenes") {
            Some(Value::Array(a)) => a.len(),
            _ => 0,
        };
        if scene_count > 0 {
            // A missing or unusable index points at the last scene.
            if !obj.get("activeSceneIndex").map(Value::is_u64).unwrap_or(false) {
                obj.insert("activeSceneIndex".to_string(), Value::from(scene_count - 1));
            }
            let state: StoryState = serde_json::from_value(Value::Object(obj))
                .map_err(|e| VisualboardError::InvalidState(e.to_string()))?;
            return Ok(state);
        }

        let legacy_scene = match obj.get("scene") {
            Some(Value::Object(scene)) if obj.contains_key("characters") => scene.clone(),
            _ => {
                return Err(VisualboardError::InvalidState(
                    "missing scenes and scene".to_string(),
                ))
            }
        };

        obj.remove("scene");
        obj.remove("scenes");
        let characters = obj.remove("characters").unwrap_or(Value::Array(vec![]));
        let dialogue_impact = obj.remove("dialogue_impact");

        let mut scene_obj = legacy_scene;
        scene_obj.insert("characters".to_string(), characters);
        if let Some(impact) = dialogue_impact.filter(|v| !v.is_null()) {
            scene_obj.insert("dialogue_impact".to_string(), impact);
        }
        let scene: Scene = serde_json::from_value(Value::Object(scene_obj))
            .map_err(|e| VisualboardError::InvalidState(e.to_string()))?;

        obj.remove("activeSceneIndex");
        let relations = match obj.remove("relations") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };

        tracing::debug!("Upgraded single-scene story state to scenes[]");
        Ok(StoryState {
            scenes: vec![scene],
            active_scene_index: 0,
            relations,
            extra: obj,
        })
    }

    /// Canonical form pushed to the board: relations are always empty.
    pub fn normalized(mut self) -> Self {
        self.relations.clear();
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Full-state fingerprint for push/absorb dedup.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn characters(&self) -> impl Iterator<Item = &CharacterRef> {
        self.scenes.iter().flat_map(|s| s.characters.iter())
    }

    pub fn characters_mut(&mut self) -> impl Iterator<Item = &mut CharacterRef> {
        self.scenes.iter_mut().flat_map(|s| s.characters.iter_mut())
    }

    pub fn location_names(&self) -> Vec<&str> {
        self.scenes
            .iter()
            .take(5)
            .map(|s| s.location_name.as_deref().unwrap_or("(없음)"))
            .collect()
    }
}
