//! `visualboard-v1` window-message protocol between the Side Panel and the
//! embedded board.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ScenarioKey;

pub const PROTOCOL_VERSION: &str = "visualboard-v1";
pub const SIDEPANEL_SENDER: &str = "visualboard-sidepanel";
pub const BOARD_SENDER: &str = "test-board";

pub const STORY_STATE_UPDATE: &str = "STORY_STATE_UPDATE";
pub const RESET_STORY_STATE: &str = "RESET_STORY_STATE";
pub const CAST_STORE_UPDATE: &str = "CAST_STORE_UPDATE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameMessage {
    StoryStateUpdate {
        state: Value,
        #[serde(rename = "scenarioKey", default)]
        scenario_key: Option<ScenarioKey>,
    },
    ResetStoryState,
    CastStoreUpdate {
        #[serde(rename = "scenarioKey", default)]
        scenario_key: Option<ScenarioKey>,
        #[serde(rename = "castStore", default)]
        cast_store: Value,
    },
}

impl FrameMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            FrameMessage::StoryStateUpdate { .. } => STORY_STATE_UPDATE,
            FrameMessage::ResetStoryState => RESET_STORY_STATE,
            FrameMessage::CastStoreUpdate { .. } => CAST_STORE_UPDATE,
        }
    }
}

/// `{ protocol, sender, type, ...payload, timestamp }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEnvelope {
    pub protocol: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(flatten)]
    pub message: FrameMessage,
    #[serde(default)]
    pub timestamp: i64,
}

impl FrameEnvelope {
    /// Envelope sent by the Side Panel.
    pub fn outbound(message: FrameMessage, timestamp: i64) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            sender: Some(SIDEPANEL_SENDER.to_string()),
            message,
            timestamp,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A raw window message as delivered to the Side Panel.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrameMessage {
    pub origin: String,
    pub data: Value,
}

impl InboundFrameMessage {
    pub fn new(origin: impl Into<String>, data: Value) -> Self {
        Self {
            origin: origin.into(),
            data,
        }
    }
}
