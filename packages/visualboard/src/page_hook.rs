//! Page Hook: runs in the host page's own realm and watches the page's own
//! network responses for bot/character metadata.
//!
//! The hook wraps the page's fetch capability once per page load. Requests
//! that match none of the data endpoints pass straight through. For matching
//! requests the response is returned to the caller untouched while a copy is
//! parsed on a separate task; parse failures are swallowed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::model::BotMetadata;

/// Tag on every page -> content-script message published by the hook.
pub const PAGE_HOOK_SOURCE: &str = "rofan-visualboard-page-hook";

/// Substrings of request URLs worth inspecting.
pub const DATA_URL_PATTERNS: &[&str] = &[
    "/_next/data/",
    "/api/chat",
    "/api/bot",
    "/api/character",
];

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

impl FetchResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }
}

/// The page's network-fetch capability.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;
}

/// Message crossing the page -> content-script boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageHookMessage {
    pub source: String,
    pub payload: BotMetadata,
}

pub fn matches_data_url(url: &str) -> bool {
    DATA_URL_PATTERNS.iter().any(|p| url.contains(p))
}

/// Fetch wrapper installed by the hook.
pub struct HookedFetch {
    inner: Arc<dyn Fetch>,
    publisher: mpsc::UnboundedSender<PageHookMessage>,
}

impl HookedFetch {
    pub fn new(inner: Arc<dyn Fetch>, publisher: mpsc::UnboundedSender<PageHookMessage>) -> Self {
        Self { inner, publisher }
    }
}

#[async_trait]
impl Fetch for HookedFetch {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        if !matches_data_url(&request.url) {
            return self.inner.fetch(request).await;
        }

        let url = request.url.clone();
        let response = self.inner.fetch(request).await?;

        let copy = response.clone();
        let publisher = self.publisher.clone();
        tokio::spawn(async move {
            let Ok(body) = serde_json::from_str::<Value>(&copy.body) else {
                tracing::debug!("Page hook: non-JSON body from {}", url);
                return;
            };
            if let Some(payload) = extract_bot_metadata(&body) {
                let _ = publisher.send(PageHookMessage {
                    source: PAGE_HOOK_SOURCE.to_string(),
                    payload,
                });
            }
        });

        Ok(response)
    }
}

/// The page's main world, as far as the hook is concerned: its current
/// fetch capability and the one-time install marker.
pub struct PageRealm {
    fetch: RwLock<Arc<dyn Fetch>>,
    hook_installed: AtomicBool,
}

impl PageRealm {
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self {
            fetch: RwLock::new(fetch),
            hook_installed: AtomicBool::new(false),
        }
    }

    /// The fetch the page's own code currently calls.
    pub fn fetch(&self) -> Arc<dyn Fetch> {
        match self.fetch.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_hooked(&self) -> bool {
        self.hook_installed.load(Ordering::SeqCst)
    }

    /// Wrap the page's fetch. Returns false when already installed.
    pub fn install_hook(&self, publisher: mpsc::UnboundedSender<PageHookMessage>) -> bool {
        if self.hook_installed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut slot = match self.fetch.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let hooked = HookedFetch::new(slot.clone(), publisher);
        *slot = Arc::new(hooked);
        tracing::debug!("Page hook installed");
        true
    }
}

pub(crate) fn str_field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match obj.get(*name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

pub(crate) fn object_field<'a>(
    obj: &'a Map<String, Value>,
    names: &[&str],
) -> Option<&'a Map<String, Value>> {
    names.iter().find_map(|name| obj.get(*name).and_then(Value::as_object))
}

/// Find the metadata object in one of the known envelopes:
/// Next.js data (`{ pageProps }`, or `{ props: { pageProps } }` for the
/// embedded blob) and API replies (`{ data }`).
pub(crate) fn metadata_root(body: &Value) -> Option<&Map<String, Value>> {
    let obj = body.as_object()?;
    let page_props = object_field(obj, &["pageProps"]).or_else(|| {
        object_field(obj, &["props"]).and_then(|props| object_field(props, &["pageProps"]))
    });
    let envelope = page_props.or_else(|| object_field(obj, &["data"]))?;
    Some(object_field(envelope, &["chat", "chatData", "chatInfo"]).unwrap_or(envelope))
}

/// Pull minimized bot metadata out of a response body. Requires both a chat
/// id and a bot id; anything else is skipped. Only whitelisted text fields
/// are copied so credentials and account identifiers never leave the page.
pub fn extract_bot_metadata(body: &Value) -> Option<BotMetadata> {
    let root = metadata_root(body)?;
    let bot = object_field(root, &["bot", "character"]);
    let user = object_field(root, &["user", "userProfile", "chatUser"]);

    let chat_id = str_field(root, &["chatId", "chat_id"])?;
    let bot_id = str_field(root, &["botId", "bot_id", "characterId"])
        .or_else(|| bot.and_then(|b| str_field(b, &["id", "botId", "_id"])))?;

    let from_bot = |names: &[&str]| {
        bot.and_then(|b| str_field(b, names))
            .or_else(|| str_field(root, names))
    };
    let from_user = |names: &[&str], flat: &[&str]| {
        user.and_then(|u| str_field(u, names))
            .or_else(|| str_field(root, flat))
    };

    Some(BotMetadata {
        chat_id,
        bot_id,
        char_name: from_bot(&["charName", "name"]),
        persona: from_bot(&["persona", "description"]),
        worldview: from_bot(&["worldview", "world", "worldSetting"]),
        user_name: from_user(&["name", "nickname", "userName"], &["userName"]),
        user_persona: from_user(&["persona", "userPersona"], &["userPersona"]),
        first_message: from_bot(&["firstMessage", "first_message", "greeting"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct CountingFetch {
        calls: AtomicUsize,
        body: String,
    }

    #[async_trait]
    impl Fetch for CountingFetch {
        async fn fetch(&self, _request: FetchRequest) -> Result<FetchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchResponse::ok(self.body.clone()))
        }
    }

    fn api_body() -> String {
        json!({
            "data": {
                "chatId": "abc",
                "bot": {"id": "bot-1", "name": "Elena", "worldview": "Empire"},
                "user": {"nickname": "Rin", "email": "rin@example.com", "token": "secret"},
                "sessionToken": "secret-session"
            }
        })
        .to_string()
    }

    #[test]
    fn extracts_from_both_envelopes() {
        let api: Value = serde_json::from_str(&api_body()).unwrap();
        let meta = extract_bot_metadata(&api).unwrap();
        assert_eq!(meta.chat_id, "abc");
        assert_eq!(meta.bot_id, "bot-1");
        assert_eq!(meta.char_name.as_deref(), Some("Elena"));
        assert_eq!(meta.user_name.as_deref(), Some("Rin"));

        let next = json!({
            "pageProps": {
                "chatData": {"chatId": "xyz", "botId": "b2", "firstMessage": "Hello."}
            }
        });
        let meta = extract_bot_metadata(&next).unwrap();
        assert_eq!(meta.bot_id, "b2");
        assert_eq!(meta.first_message.as_deref(), Some("Hello."));
    }

    #[test]
    fn payload_never_carries_credentials() {
        let api: Value = serde_json::from_str(&api_body()).unwrap();
        let meta = extract_bot_metadata(&api).unwrap();
        let wire = serde_json::to_string(&meta).unwrap();
        assert!(!wire.contains("secret"));
        assert!(!wire.contains("example.com"));
    }

    #[test]
    fn requires_chat_and_bot_ids() {
        assert!(extract_bot_metadata(&json!({"data": {"chatId": "abc"}})).is_none());
        assert!(extract_bot_metadata(&json!({"data": {"botId": "b"}})).is_none());
        assert!(extract_bot_metadata(&json!([1, 2])).is_none());
    }

    #[tokio::test]
    async fn hook_installs_once_and_publishes_matching_responses() {
        let base = Arc::new(CountingFetch {
            calls: AtomicUsize::new(0),
            body: api_body(),
        });
        let realm = PageRealm::new(base.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(realm.install_hook(tx.clone()));
        assert!(!realm.install_hook(tx));

        let resp = realm
            .fetch()
            .fetch(FetchRequest::get("https://rofan.ai/api/chat/abc"))
            .await
            .unwrap();
        assert_eq!(resp.body, api_body());
        assert_eq!(base.calls.load(Ordering::SeqCst), 1);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.source, PAGE_HOOK_SOURCE);
        assert_eq!(msg.payload.chat_id, "abc");

        realm
            .fetch()
            .fetch(FetchRequest::get("https://cdn.rofan.ai/img.png"))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unparseable_bodies_do_not_fail_the_caller() {
        let base = Arc::new(CountingFetch {
            calls: AtomicUsize::new(0),
            body: "<html>".to_string(),
        });
        let realm = PageRealm::new(base);
        let (tx, mut rx) = mpsc::unbounded_channel();
        realm.install_hook(tx);

        let resp = realm
            .fetch()
            .fetch(FetchRequest::get("https://rofan.ai/_next/data/x/chat.json"))
            .await
            .unwrap();
        assert_eq!(resp.body, "<html>");
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
