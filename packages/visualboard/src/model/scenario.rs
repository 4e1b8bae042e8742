use serde::{Deserialize, Serialize};
use url::Url;

/// Stable per-conversation identity: `origin + pathname` of the chat page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioKey(String);

impl ScenarioKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScenarioKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScenarioKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Conversation id taken from the URL path; keys bot/session metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// URL rules for the one chat site the extension targets.
/// Both `/chat/...` and `/en/chat/...` paths are conversations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSite {
    host: String,
}

impl Default for ChatSite {
    fn default() -> Self {
        Self::new("rofan.ai")
    }
}

impl ChatSite {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn parse_on_site(&self, href: &str) -> Option<Url> {
        let url = Url::parse(href).ok()?;
        (url.host_str() == Some(self.host.as_str())).then_some(url)
    }

    pub fn is_site_url(&self, href: &str) -> bool {
        self.parse_on_site(href).is_some()
    }

    /// Page-side check: exact host and a chat path prefix.
    pub fn is_chat_page(&self, href: &str) -> bool {
        self.parse_on_site(href)
            .map(|url| is_chat_path(url.path()))
            .unwrap_or(false)
    }

    /// Tab-side check used by the background router, which only sees tab URLs.
    pub fn is_chat_tab_url(&self, href: &str) -> bool {
        href.starts_with(&format!("https://{}/", self.host)) && href.contains("/chat/")
    }

    pub fn scenario_key(&self, href: &str) -> Option<ScenarioKey> {
        let url = self.parse_on_site(href)?;
        if !is_chat_path(url.path()) {
            return None;
        }
        Some(ScenarioKey(format!(
            "{}{}",
            url.origin().ascii_serialization(),
            url.path()
        )))
    }

    /// Segment right after `chat/`.
    pub fn chat_id(&self, href: &str) -> Option<ChatId> {
        let url = self.parse_on_site(href)?;
        chat_id_from_path(url.path())
    }
}

fn is_chat_path(path: &str) -> bool {
    path.starts_with("/chat/") || path.starts_with("/en/chat/")
}

pub fn chat_id_from_path(path: &str) -> Option<ChatId> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    segments.find(|s| *s == "chat")?;
    segments.next().map(ChatId::new)
}
