//! The embedded board iframe: outbound pushes and the inbound filter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::session::SidePanelSession;
use crate::error::{Result, VisualboardError};
use crate::model::{CastStore, ScenarioKey, StoryState};
use crate::protocol::iframe::{
    FrameEnvelope, FrameMessage, InboundFrameMessage, BOARD_SENDER, CAST_STORE_UPDATE,
    SIDEPANEL_SENDER, STORY_STATE_UPDATE,
};

/// `postMessage` target inside the panel.
pub trait BoardFrame: Send + Sync {
    /// False until the iframe's content window exists.
    fn is_ready(&self) -> bool;

    fn post(&self, envelope: &FrameEnvelope) -> Result<()>;

    /// Point the iframe at a new source (environment switch).
    fn load(&self, src: &str);
}

/// In-process frame that keeps every envelope it receives.
#[derive(Debug)]
pub struct RecordingFrame {
    ready: AtomicBool,
    src: Mutex<String>,
    posted: Mutex<Vec<FrameEnvelope>>,
}

impl Default for RecordingFrame {
    fn default() -> Self {
        Self {
            ready: AtomicBool::new(true),
            src: Mutex::new(String::new()),
            posted: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn src(&self) -> String {
        self.src.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn posted(&self) -> Vec<FrameEnvelope> {
        self.posted.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Envelopes of one message type.
    pub fn posted_of(&self, kind: &str) -> Vec<FrameEnvelope> {
        self.posted()
            .into_iter()
            .filter(|e| e.message.kind() == kind)
            .collect()
    }
}

impl BoardFrame for RecordingFrame {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn post(&self, envelope: &FrameEnvelope) -> Result<()> {
        if !self.is_ready() {
            return Err(VisualboardError::FrameNotReady);
        }
        let mut posted = self
            .posted
            .lock()
            .map_err(|_| VisualboardError::Other("frame log poisoned".to_string()))?;
        posted.push(envelope.clone());
        Ok(())
    }

    fn load(&self, src: &str) {
        if let Ok(mut current) = self.src.lock() {
            *current = src.to_string();
        }
    }
}

/// Result of one outbound `STORY_STATE_UPDATE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    Posted { message_id: String },
    /// Identical to the last push; counts as delivered.
    Duplicate,
    /// Inside the minimum interval since the last push.
    Throttled,
    NotReady,
}

impl PostOutcome {
    /// Whether the board can be considered to show the state.
    pub fn is_delivered(&self) -> bool {
        matches!(self, PostOutcome::Posted { .. } | PostOutcome::Duplicate)
    }
}

/// Push `state` to the board with dedup and rate limiting.
pub fn post_story_state(
    frame: &dyn BoardFrame,
    session: &mut SidePanelSession,
    state: &StoryState,
    scenario_key: &ScenarioKey,
    min_interval: Duration,
    timestamp: i64,
) -> Result<PostOutcome> {
    if state.scenes.is_empty() {
        return Err(VisualboardError::InvalidState(
            "state.scenes must be a non-empty array".to_string(),
        ));
    }
    if !frame.is_ready() {
        tracing::warn!("Board iframe not ready, dropping state push");
        return Ok(PostOutcome::NotReady);
    }

    let fingerprint = state.fingerprint();
    if session.last_posted_fingerprint() == Some(fingerprint.as_str()) {
        tracing::debug!("Skipping duplicate state push");
        return Ok(PostOutcome::Duplicate);
    }

    let now = Instant::now();
    if let Some(last) = session.last_post_at() {
        if now.duration_since(last) < min_interval {
            tracing::debug!("Throttling state push");
            return Ok(PostOutcome::Throttled);
        }
    }

    let envelope = FrameEnvelope::outbound(
        FrameMessage::StoryStateUpdate {
            state: state.to_value(),
            scenario_key: Some(scenario_key.clone()),
        },
        timestamp,
    );
    frame.post(&envelope)?;

    let message_id = session.record_post(fingerprint, now, timestamp);
    tracing::info!(
        message_id = %message_id,
        scenes = state.scenes.len(),
        active_scene = state.active_scene_index,
        locations = ?state.location_names(),
        "Posted STORY_STATE_UPDATE"
    );
    Ok(PostOutcome::Posted { message_id })
}

/// Tell the board to clear itself.
pub fn post_reset(frame: &dyn BoardFrame, timestamp: i64) -> Result<()> {
    if !frame.is_ready() {
        return Err(VisualboardError::FrameNotReady);
    }
    frame.post(&FrameEnvelope::outbound(FrameMessage::ResetStoryState, timestamp))
}

/// What the panel does with one inbound window message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ignore(&'static str),
    /// Board-originated state, taken as fact.
    AbsorbState(StoryState),
    /// Board-migrated cast store for the current scenario.
    SaveCast {
        scenario_key: ScenarioKey,
        cast: CastStore,
    },
}

/// Filter an inbound message against the allowed origin and the session.
pub fn classify_inbound(
    message: &InboundFrameMessage,
    allowed_origin: &str,
    session: &SidePanelSession,
) -> Inbound {
    if message.origin != allowed_origin {
        tracing::debug!(
            received = %message.origin,
            expected = allowed_origin,
            "Ignoring message: origin mismatch"
        );
        return Inbound::Ignore("origin mismatch");
    }
    let Value::Object(data) = &message.data else {
        return Inbound::Ignore("invalid data format");
    };

    let sender = data.get("sender").and_then(Value::as_str);
    let kind = data.get("type").and_then(Value::as_str).unwrap_or_default();

    if sender == Some(SIDEPANEL_SENDER) {
        return Inbound::Ignore("sender is self");
    }
    if sender == Some(BOARD_SENDER) && kind != CAST_STORE_UPDATE {
        return Inbound::Ignore("board may only send cast updates");
    }
    if kind != STORY_STATE_UPDATE && kind != CAST_STORE_UPDATE {
        return Inbound::Ignore("unsupported type");
    }

    let scenario_key = data
        .get("scenarioKey")
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
        .map(ScenarioKey::new);

    if kind == CAST_STORE_UPDATE {
        return classify_cast_update(scenario_key, data.get("castStore"), session);
    }

    if sender.is_none() {
        tracing::warn!("STORY_STATE_UPDATE without sender, ignoring");
        return Inbound::Ignore("missing sender");
    }
    if let Some(key) = &scenario_key {
        if session.scenario_key() != Some(key) {
            return Inbound::Ignore("scenario key mismatch");
        }
    }

    let state = match data.get("state").cloned().map(StoryState::from_value) {
        Some(Ok(state)) => state,
        Some(Err(e)) => {
            tracing::warn!("Ignoring inbound state: {}", e);
            return Inbound::Ignore("invalid state");
        }
        None => return Inbound::Ignore("missing state"),
    };

    if session.story_state().map(StoryState::fingerprint) == Some(state.fingerprint()) {
        return Inbound::Ignore("state unchanged");
    }
    Inbound::AbsorbState(state)
}

fn classify_cast_update(
    scenario_key: Option<ScenarioKey>,
    cast_store: Option<&Value>,
    session: &SidePanelSession,
) -> Inbound {
    let (Some(scenario_key), Some(cast_store)) = (scenario_key, cast_store.filter(|c| !c.is_null()))
    else {
        tracing::warn!("CAST_STORE_UPDATE missing scenarioKey or castStore");
        return Inbound::Ignore("incomplete cast update");
    };
    if session.scenario_key() != Some(&scenario_key) {
        return Inbound::Ignore("scenario key mismatch");
    }
    if cast_store.get("version").and_then(Value::as_str) != Some(crate::model::cast::CAST_STORE_VERSION) {
        tracing::warn!("CAST_STORE_UPDATE with unsupported version");
        return Inbound::Ignore("cast store version");
    }
    match serde_json::from_value::<CastStore>(cast_store.clone()) {
        Ok(cast) => Inbound::SaveCast { scenario_key, cast },
        Err(e) => {
            tracing::warn!("Ignoring malformed cast store: {}", e);
            Inbound::Ignore("invalid cast store")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TurnId;
    use serde_json::json;

    const ORIGIN: &str = "https://rofan.world";

    fn state(summary: &str) -> StoryState {
        StoryState::from_value(json!({"scenes": [{"summary": summary}]})).unwrap()
    }

    fn session_for(key: &ScenarioKey) -> SidePanelSession {
        let mut session = SidePanelSession::new();
        session.handle_scenario_change(Some(key));
        session
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_push_posts_once() {
        let frame = RecordingFrame::new();
        let key = ScenarioKey::new("k");
        let mut session = session_for(&key);
        let s = state("a");
        let interval = Duration::from_millis(100);

        let first = post_story_state(&frame, &mut session, &s, &key, interval, 1).unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        let second = post_story_state(&frame, &mut session, &s, &key, interval, 2).unwrap();

        assert!(matches!(first, PostOutcome::Posted { .. }));
        assert_eq!(second, PostOutcome::Duplicate);
        assert!(second.is_delivered());
        assert_eq!(frame.posted_of(STORY_STATE_UPDATE).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pushes_inside_the_interval_are_throttled() {
        let frame = RecordingFrame::new();
        let key = ScenarioKey::new("k");
        let mut session = session_for(&key);
        let interval = Duration::from_millis(100);

        post_story_state(&frame, &mut session, &state("a"), &key, interval, 1).unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;
        let throttled = post_story_state(&frame, &mut session, &state("b"), &key, interval, 2).unwrap();
        assert_eq!(throttled, PostOutcome::Throttled);

        tokio::time::advance(Duration::from_millis(60)).await;
        let posted = post_story_state(&frame, &mut session, &state("b"), &key, interval, 3).unwrap();
        assert!(posted.is_delivered());
        assert_eq!(frame.posted().len(), 2);
    }

    #[tokio::test]
    async fn envelope_carries_protocol_and_scenario() {
        let frame = RecordingFrame::new();
        let key = ScenarioKey::new("https://rofan.ai/chat/abc");
        let mut session = session_for(&key);
        post_story_state(&frame, &mut session, &state("a"), &key, Duration::ZERO, 42).unwrap();

        let value = frame.posted()[0].to_value();
        assert_eq!(value["protocol"], "visualboard-v1");
        assert_eq!(value["sender"], SIDEPANEL_SENDER);
        assert_eq!(value["type"], STORY_STATE_UPDATE);
        assert_eq!(value["scenarioKey"], "https://rofan.ai/chat/abc");
        assert_eq!(value["timestamp"], 42);
        assert_eq!(value["state"]["scenes"][0]["summary"], "a");
    }

    #[tokio::test]
    async fn unready_frame_is_reported() {
        let frame = RecordingFrame::new();
        frame.set_ready(false);
        let key = ScenarioKey::new("k");
        let mut session = session_for(&key);
        let outcome =
            post_story_state(&frame, &mut session, &state("a"), &key, Duration::ZERO, 1).unwrap();
        assert_eq!(outcome, PostOutcome::NotReady);
        assert!(post_reset(&frame, 1).is_err());
    }

    #[test]
    fn inbound_filter_rejects_foreign_and_self_messages() {
        let key = ScenarioKey::new("k");
        let session = session_for(&key);
        let update = json!({
            "protocol": "visualboard-v1",
            "sender": "other",
            "type": STORY_STATE_UPDATE,
            "state": {"scenes": [{"summary": "x"}]},
            "scenarioKey": "k"
        });

        let wrong_origin = InboundFrameMessage::new("https://evil.example", update.clone());
        assert_eq!(
            classify_inbound(&wrong_origin, ORIGIN, &session),
            Inbound::Ignore("origin mismatch")
        );

        let mut own = update.clone();
        own["sender"] = json!(SIDEPANEL_SENDER);
        assert_eq!(
            classify_inbound(&InboundFrameMessage::new(ORIGIN, own), ORIGIN, &session),
            Inbound::Ignore("sender is self")
        );

        let mut board = update.clone();
        board["sender"] = json!(BOARD_SENDER);
        assert!(matches!(
            classify_inbound(&InboundFrameMessage::new(ORIGIN, board), ORIGIN, &session),
            Inbound::Ignore(_)
        ));

        let mut other_key = update.clone();
        other_key["scenarioKey"] = json!("other");
        assert_eq!(
            classify_inbound(&InboundFrameMessage::new(ORIGIN, other_key), ORIGIN, &session),
            Inbound::Ignore("scenario key mismatch")
        );

        assert!(matches!(
            classify_inbound(&InboundFrameMessage::new(ORIGIN, update), ORIGIN, &session),
            Inbound::AbsorbState(_)
        ));
    }

    #[test]
    fn inbound_state_equal_to_current_is_ignored() {
        let key = ScenarioKey::new("k");
        let mut session = session_for(&key);
        session.adopt(&key, TurnId::new("T"), state("x"));
        let msg = InboundFrameMessage::new(
            ORIGIN,
            json!({"sender": "other", "type": STORY_STATE_UPDATE, "state": {"scenes": [{"summary": "x"}]}}),
        );
        assert_eq!(
            classify_inbound(&msg, ORIGIN, &session),
            Inbound::Ignore("state unchanged")
        );
    }

    #[test]
    fn cast_updates_need_matching_key_and_v2() {
        let key = ScenarioKey::new("k");
        let session = session_for(&key);
        let cast = json!({"version": "v2", "charactersById": {}, "aliasMap": {}});

        let ok = InboundFrameMessage::new(
            ORIGIN,
            json!({"sender": BOARD_SENDER, "type": CAST_STORE_UPDATE, "scenarioKey": "k", "castStore": cast}),
        );
        assert!(matches!(
            classify_inbound(&ok, ORIGIN, &session),
            Inbound::SaveCast { .. }
        ));

        let old = InboundFrameMessage::new(
            ORIGIN,
            json!({"sender": BOARD_SENDER, "type": CAST_STORE_UPDATE, "scenarioKey": "k", "castStore": {"version": "v1"}}),
        );
        assert_eq!(
            classify_inbound(&old, ORIGIN, &session),
            Inbound::Ignore("cast store version")
        );

        let other = InboundFrameMessage::new(
            ORIGIN,
            json!({"sender": BOARD_SENDER, "type": CAST_STORE_UPDATE, "scenarioKey": "x", "castStore": cast}),
        );
        assert_eq!(
            classify_inbound(&other, ORIGIN, &session),
            Inbound::Ignore("scenario key mismatch")
        );
    }
}
