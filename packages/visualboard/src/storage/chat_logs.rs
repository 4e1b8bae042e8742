use std::sync::Arc;

use serde_json::{json, Value};

use super::{keys, KeyValueStore};
use crate::error::Result;
use crate::model::turn::normalize_json_logs;
use crate::model::{
    now_millis, AnalysisBotContext, BotContext, BotMetadata, ChatId, ChatUser, TurnLogEntry,
};

/// Content-Bridge-owned keys: turn logs, first message and bot metadata.
/// Other contexts only read through this type.
#[derive(Clone)]
pub struct ChatLogStore {
    store: Arc<dyn KeyValueStore>,
}

impl ChatLogStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn logs(&self, chat_id: &ChatId) -> Result<Vec<TurnLogEntry>> {
        let Some(value) = self.store.get(&keys::chat_logs(chat_id)).await? else {
            return Ok(Vec::new());
        };
        if let Ok(entries) = serde_json::from_value::<Vec<TurnLogEntry>>(value.clone()) {
            return Ok(entries);
        }
        // Written by an older build with upstream field names.
        match value {
            Value::Array(items) => Ok(normalize_json_logs(&items, now_millis())),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn save_logs(&self, chat_id: &ChatId, entries: &[TurnLogEntry]) -> Result<()> {
        self.store
            .set(&keys::chat_logs(chat_id), serde_json::to_value(entries)?)
            .await
    }

    /// Append one turn unless it repeats the last stored one.
    pub async fn append_log(&self, chat_id: &ChatId, entry: TurnLogEntry) -> Result<bool> {
        let mut entries = self.logs(chat_id).await?;
        let duplicate = match (&entry.log_id, entries.last()) {
            (Some(id), _) => entries.iter().any(|e| e.log_id.as_deref() == Some(id)),
            (None, Some(last)) => {
                last.assistant_text == entry.assistant_text && last.user_text == entry.user_text
            }
            (None, None) => false,
        };
        if duplicate {
            return Ok(false);
        }
        entries.push(entry);
        self.save_logs(chat_id, &entries).await?;
        Ok(true)
    }

    pub async fn is_initialized(&self, chat_id: &ChatId) -> Result<bool> {
        Ok(self
            .store
            .get(&keys::chat_logs_initialized(chat_id))
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    pub async fn mark_initialized(&self, chat_id: &ChatId) -> Result<()> {
        self.store
            .set(&keys::chat_logs_initialized(chat_id), Value::Bool(true))
            .await
    }

    pub async fn first_message(&self, chat_id: &ChatId) -> Result<Option<String>> {
        Ok(self
            .store
            .get(&keys::first_message(chat_id))
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.trim().is_empty()))
    }

    pub async fn save_first_message(&self, chat_id: &ChatId, text: &str) -> Result<()> {
        self.store
            .set(&keys::first_message(chat_id), Value::String(text.to_string()))
            .await
    }

    pub async fn bot_for_chat(&self, chat_id: &ChatId) -> Result<Option<String>> {
        let value = self.store.get(&keys::session_map(chat_id)).await?;
        Ok(match value {
            Some(Value::String(bot_id)) => Some(bot_id),
            Some(Value::Object(obj)) => obj
                .get("botId")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            _ => None,
        })
    }

    pub async fn bot_context(&self, bot_id: &str) -> Result<Option<BotContext>> {
        self.typed(&keys::bot_master(bot_id)).await
    }

    pub async fn chat_user(&self, chat_id: &ChatId) -> Result<Option<ChatUser>> {
        self.typed(&keys::chat_user(chat_id)).await
    }

    /// Persist metadata published by the page hook or parsed from page data.
    pub async fn save_metadata(&self, meta: &BotMetadata) -> Result<()> {
        let chat_id = ChatId::new(meta.chat_id.clone());
        let now = now_millis();

        self.store
            .set(
                &keys::session_map(&chat_id),
                json!({ "botId": meta.bot_id, "updatedAt": now }),
            )
            .await?;
        self.store
            .set(
                &keys::bot_master(&meta.bot_id),
                serde_json::to_value(meta.bot_context(now))?,
            )
            .await?;
        if let Some(user) = meta.chat_user(now) {
            self.store
                .set(&keys::chat_user(&chat_id), serde_json::to_value(user)?)
                .await?;
        }
        if let Some(first) = meta.first_message.as_deref().filter(|s| !s.trim().is_empty()) {
            if self.first_message(&chat_id).await?.is_none() {
                self.save_first_message(&chat_id, first).await?;
            }
        }

        tracing::debug!(
            "Stored bot metadata for chat {} (bot {})",
            meta.chat_id,
            meta.bot_id
        );
        Ok(())
    }

    /// Resolve the analysis `botContext` for a chat. Absence is not an error.
    pub async fn analysis_bot_context(
        &self,
        chat_id: &ChatId,
    ) -> Result<Option<AnalysisBotContext>> {
        let bot = match self.bot_for_chat(chat_id).await? {
            Some(bot_id) => self.bot_context(&bot_id).await?,
            None => None,
        };
        let user = self.chat_user(chat_id).await?;
        Ok(AnalysisBotContext::merge(bot.as_ref(), user.as_ref()))
    }

    async fn typed<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(value) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable value at {}: {}", key, e);
                Ok(None)
            }
        }
    }
}
