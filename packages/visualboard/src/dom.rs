//! DOM Extractor: recover the latest turn and the first-message bootstrap
//! text from whatever the page renders or embeds.
//!
//! Fallback order, each step tried only when the previous produced nothing:
//! 1. the latest rendered turn block
//! 2. the stored turn log (last entry with assistant text)
//! 3. the cached first message
//! 4. the first message parsed from the embedded page-data blob (written back)
//! 5. the last scenario-intro block
//! 6. not found

use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::model::turn::{combined_turn_text, last_assistant_text, normalize_json_logs};
use crate::model::{BotMetadata, ChatId, ChatSite, ScenarioKey, TurnLogEntry};
use crate::page_hook::{extract_bot_metadata, metadata_root, object_field, str_field};
use crate::protocol::runtime::{ExtractionSource, FailureReason, LastAiMessageResponse};
use crate::storage::ChatLogStore;

#[derive(Debug, Clone, PartialEq)]
pub struct Paragraph {
    pub text: String,
    /// Carries the AI-role class
    pub ai_classed: bool,
}

impl Paragraph {
    pub fn ai(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ai_classed: true,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ai_classed: false,
        }
    }
}

/// One rendered conversation block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnBlock {
    pub paragraphs: Vec<Paragraph>,
    /// Fingerprint stamped by the content bridge once the block was reported
    pub marker: Option<String>,
}

impl TurnBlock {
    pub fn new(paragraphs: Vec<Paragraph>) -> Self {
        Self {
            paragraphs,
            marker: None,
        }
    }
}

/// Read access to the rendered page, plus the block marker write.
pub trait PageDom: Send + Sync {
    fn location(&self) -> String;
    fn turn_blocks(&self) -> Vec<TurnBlock>;
    /// Texts of blocks matching the scenario-intro inline style
    fn intro_blocks(&self) -> Vec<String>;
    /// Raw embedded initial-data blob
    fn page_data(&self) -> Option<String>;
    fn mark_block(&self, index: usize, marker: &str);
    /// Mutation notifications for the chat container, `None` if it is not rendered
    fn observe_chat_root(&self) -> Option<broadcast::Receiver<()>>;
}

#[derive(Debug, Default)]
struct Snapshot {
    location: String,
    blocks: Vec<TurnBlock>,
    intro_blocks: Vec<String>,
    page_data: Option<String>,
    has_chat_root: bool,
}

/// In-process page whose content is set by the caller. Every change fires a
/// mutation notification.
#[derive(Clone)]
pub struct StaticDom {
    snapshot: Arc<RwLock<Snapshot>>,
    mutations: broadcast::Sender<()>,
}

impl StaticDom {
    pub fn new(location: impl Into<String>) -> Self {
        let (mutations, _) = broadcast::channel(64);
        Self {
            snapshot: Arc::new(RwLock::new(Snapshot {
                location: location.into(),
                has_chat_root: true,
                ..Default::default()
            })),
            mutations,
        }
    }

    fn update(&self, f: impl FnOnce(&mut Snapshot)) {
        match self.snapshot.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
        let _ = self.mutations.send(());
    }

    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> T {
        match self.snapshot.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    pub fn push_turn(&self, user: Option<&str>, ai: &str) {
        let mut paragraphs = Vec::new();
        if let Some(user) = user {
            paragraphs.push(Paragraph::user(user));
        }
        paragraphs.push(Paragraph::ai(ai));
        self.push_block(TurnBlock::new(paragraphs));
    }

    pub fn push_block(&self, block: TurnBlock) {
        self.update(|s| s.blocks.push(block));
    }

    pub fn clear_turns(&self) {
        self.update(|s| s.blocks.clear());
    }

    pub fn push_intro(&self, text: impl Into<String>) {
        let text = text.into();
        self.update(|s| s.intro_blocks.push(text));
    }

    pub fn set_page_data(&self, raw: impl Into<String>) {
        let raw = raw.into();
        self.update(|s| s.page_data = Some(raw));
    }

    /// SPA navigation: location changes, rendered content is replaced.
    pub fn navigate(&self, location: impl Into<String>) {
        let location = location.into();
        self.update(|s| {
            s.location = location;
            s.blocks.clear();
            s.intro_blocks.clear();
            s.page_data = None;
        });
    }

    pub fn set_chat_root(&self, present: bool) {
        self.update(|s| s.has_chat_root = present);
    }

    pub fn block_markers(&self) -> Vec<Option<String>> {
        self.read(|s| s.blocks.iter().map(|b| b.marker.clone()).collect())
    }
}

impl PageDom for StaticDom {
    fn location(&self) -> String {
        self.read(|s| s.location.clone())
    }

    fn turn_blocks(&self) -> Vec<TurnBlock> {
        self.read(|s| s.blocks.clone())
    }

    fn intro_blocks(&self) -> Vec<String> {
        self.read(|s| s.intro_blocks.clone())
    }

    fn page_data(&self) -> Option<String> {
        self.read(|s| s.page_data.clone())
    }

    fn mark_block(&self, index: usize, marker: &str) {
        // Attribute writes do not count as chat mutations.
        let write = |s: &mut Snapshot| {
            if let Some(block) = s.blocks.get_mut(index) {
                block.marker = Some(marker.to_string());
            }
        };
        match self.snapshot.write() {
            Ok(mut guard) => write(&mut guard),
            Err(poisoned) => write(&mut poisoned.into_inner()),
        }
    }

    fn observe_chat_root(&self) -> Option<broadcast::Receiver<()>> {
        self.read(|s| s.has_chat_root)
            .then(|| self.mutations.subscribe())
    }
}

/// Step-1 result: the latest rendered turn.
#[derive(Debug, Clone, PartialEq)]
pub struct DomTurn {
    pub block_index: usize,
    pub user_text: Option<String>,
    pub ai_text: String,
    pub marker: Option<String>,
}

impl DomTurn {
    pub fn text(&self) -> String {
        combined_turn_text(self.user_text.as_deref(), &self.ai_text)
    }
}

/// `{ success, source, text, userText?, aiText? }`
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub success: bool,
    pub source: Option<ExtractionSource>,
    pub text: Option<String>,
    pub user_text: Option<String>,
    pub ai_text: Option<String>,
}

impl ExtractionResult {
    pub fn not_found() -> Self {
        Self {
            success: false,
            source: None,
            text: None,
            user_text: None,
            ai_text: None,
        }
    }

    fn found(source: ExtractionSource, text: String) -> Self {
        Self {
            success: true,
            source: Some(source),
            text: Some(text),
            user_text: None,
            ai_text: None,
        }
    }

    fn turn(source: ExtractionSource, user: Option<String>, ai: String) -> Self {
        Self {
            success: true,
            source: Some(source),
            text: Some(combined_turn_text(user.as_deref(), &ai)),
            user_text: user,
            ai_text: Some(ai),
        }
    }

    pub fn into_response(self, provider: &str, scenario_key: Option<ScenarioKey>) -> LastAiMessageResponse {
        LastAiMessageResponse {
            success: self.success,
            reason: (!self.success).then_some(FailureReason::NotFound),
            provider: Some(provider.to_string()),
            text: self.text,
            user_text: self.user_text,
            ai_text: self.ai_text,
            scenario_key,
            source: self.source,
            error: None,
        }
    }
}

/// Parsed embedded initial-data blob.
#[derive(Debug, Clone)]
pub struct PageData {
    value: Value,
}

impl PageData {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok().map(|value| Self { value })
    }

    pub fn bot_metadata(&self) -> Option<BotMetadata> {
        extract_bot_metadata(&self.value)
    }

    pub fn first_message(&self) -> Option<String> {
        let root = metadata_root(&self.value)?;
        const NAMES: &[&str] = &["firstMessage", "first_message", "greeting", "intro"];
        object_field(root, &["bot", "character"])
            .and_then(|bot| str_field(bot, NAMES))
            .or_else(|| str_field(root, NAMES))
            .map(|s| s.trim().to_string())
    }

    /// Turn history embedded in the page, normalized.
    pub fn turn_logs(&self, now: i64) -> Vec<TurnLogEntry> {
        let Some(root) = metadata_root(&self.value) else {
            return Vec::new();
        };
        ["messages", "chatLogs", "logs", "history"]
            .iter()
            .find_map(|name| root.get(*name).and_then(Value::as_array))
            .map(|items| normalize_json_logs(items, now))
            .unwrap_or_default()
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Latest rendered turn. The AI paragraph is the first AI-classed one, else
/// the block's last paragraph; the user paragraph is the first non-AI one.
pub fn latest_dom_turn(dom: &dyn PageDom) -> Option<DomTurn> {
    let blocks = dom.turn_blocks();
    let block_index = blocks.len().checked_sub(1)?;
    let block = &blocks[block_index];

    let ai_index = block
        .paragraphs
        .iter()
        .position(|p| p.ai_classed)
        .or_else(|| block.paragraphs.len().checked_sub(1))?;
    let ai_text = block.paragraphs[ai_index].text.trim().to_string();
    if ai_text.is_empty() {
        return None;
    }

    let user_text = block
        .paragraphs
        .iter()
        .enumerate()
        .find(|(i, p)| *i != ai_index && !p.ai_classed)
        .map(|(_, p)| p.text.trim().to_string())
        .filter(|t| !t.is_empty());

    Some(DomTurn {
        block_index,
        user_text,
        ai_text,
        marker: block.marker.clone(),
    })
}

/// The full fallback chain. Storage failures are logged and skipped, never
/// propagated.
pub struct DomExtractor {
    site: ChatSite,
    logs: ChatLogStore,
}

impl DomExtractor {
    pub fn new(site: ChatSite, logs: ChatLogStore) -> Self {
        Self { site, logs }
    }

    pub fn chat_id(&self, dom: &dyn PageDom) -> Option<ChatId> {
        self.site.chat_id(&dom.location())
    }

    pub async fn extract(&self, dom: &dyn PageDom) -> ExtractionResult {
        if let Some(turn) = latest_dom_turn(dom) {
            return ExtractionResult::turn(ExtractionSource::Dom, turn.user_text, turn.ai_text);
        }

        let chat_id = self.chat_id(dom);

        if let Some(chat_id) = &chat_id {
            match self.logs.logs(chat_id).await {
                Ok(entries) => {
                    if let Some(entry) = last_assistant_text(&entries) {
                        let ai = entry.assistant_text.clone().unwrap_or_default();
                        return ExtractionResult::turn(
                            ExtractionSource::Store,
                            entry.user_text.clone(),
                            ai.trim().to_string(),
                        );
                    }
                }
                Err(e) => tracing::warn!("Turn log read failed: {}", e),
            }

            match self.logs.first_message(chat_id).await {
                Ok(Some(first)) => {
                    return ExtractionResult::found(ExtractionSource::FirstMessage, first);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("First message read failed: {}", e),
            }
        }

        if let Some(first) = dom
            .page_data()
            .and_then(|raw| PageData::parse(&raw))
            .and_then(|data| data.first_message())
            .filter(|t| !t.is_empty())
        {
            if let Some(chat_id) = &chat_id {
                if let Err(e) = self.logs.save_first_message(chat_id, &first).await {
                    tracing::debug!("First message write-back skipped: {}", e);
                }
            }
            return ExtractionResult::found(ExtractionSource::FirstMessage, first);
        }

        if let Some(intro) = dom
            .intro_blocks()
            .iter()
            .rev()
            .map(|t| collapse_whitespace(t))
            .find(|t| !t.is_empty())
        {
            return ExtractionResult::found(ExtractionSource::DomFirst, intro);
        }

        tracing::warn!("No AI message found on page; layout may have changed");
        ExtractionResult::not_found()
    }
}
