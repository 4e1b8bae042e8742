use serde::{Deserialize, Serialize};

/// Persona/worldview of one bot, keyed by bot id in storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub char_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worldview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_persona: Option<String>,
    pub updated_at: i64,
}

/// The user's own profile inside one chat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_persona: Option<String>,
    pub updated_at: i64,
}

/// Minimized metadata published by the page hook. Only these fields ever
/// leave the page realm; credentials and account identifiers never do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotMetadata {
    pub chat_id: String,
    pub bot_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub char_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worldview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_message: Option<String>,
}

impl BotMetadata {
    pub fn bot_context(&self, updated_at: i64) -> BotContext {
        BotContext {
            char_name: self.char_name.clone(),
            persona: self.persona.clone(),
            worldview: self.worldview.clone(),
            user_name: self.user_name.clone(),
            user_persona: self.user_persona.clone(),
            updated_at,
        }
    }

    pub fn chat_user(&self, updated_at: i64) -> Option<ChatUser> {
        if self.user_name.is_none() && self.user_persona.is_none() {
            return None;
        }
        Some(ChatUser {
            user_name: self.user_name.clone(),
            user_persona: self.user_persona.clone(),
            updated_at,
        })
    }
}

/// `botContext` block of an analysis request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisBotContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub char_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worldview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_persona: Option<String>,
}

impl AnalysisBotContext {
    /// Chat-scoped user profile overrides the bot-level copy.
    pub fn merge(bot: Option<&BotContext>, user: Option<&ChatUser>) -> Option<Self> {
        if bot.is_none() && user.is_none() {
            return None;
        }
        let ctx = Self {
            char_name: bot.and_then(|b| b.char_name.clone()),
            persona: bot.and_then(|b| b.persona.clone()),
            worldview: bot.and_then(|b| b.worldview.clone()),
            user_name: user
                .and_then(|u| u.user_name.clone())
                .or_else(|| bot.and_then(|b| b.user_name.clone())),
            user_persona: user
                .and_then(|u| u.user_persona.clone())
                .or_else(|| bot.and_then(|b| b.user_persona.clone())),
        };
        (!ctx.is_empty()).then_some(ctx)
    }

    pub fn is_empty(&self) -> bool {
        self.char_name.is_none()
            && self.persona.is_none()
            && self.worldview.is_none()
            && self.user_name.is_none()
            && self.user_persona.is_none()
    }
}
