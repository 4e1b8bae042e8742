//! Background Router: the only context that can see tabs. Forwards Side
//! Panel requests to the active chat tab and re-broadcasts detected turns
//! tagged with their tab and window. Holds no persisted state.

mod tabs;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{Config, ServerEnv};
use crate::error::{Result, VisualboardError};
use crate::model::ChatSite;
use crate::protocol::runtime::{
    EnvChanged, FailureReason, LastAiMessageRequest, LastAiMessageResponse, NewTurn, RouterLink,
    RuntimeMessage, TabMessage,
};

pub use tabs::{LocalTabs, TabInfo, TabsApi};
#[cfg(test)]
pub use tabs::MockTabsApi;

const BROADCAST_CAPACITY: usize = 64;

/// True for the delivery failure seen when no content script listens in
/// the tab yet.
pub fn is_missing_receiver(err: &VisualboardError) -> bool {
    let text = error_text(err);
    text.contains("Receiving end does not exist") || text.contains("Could not establish connection")
}

fn error_text(err: &VisualboardError) -> String {
    match err {
        VisualboardError::ChannelClosed(msg) | VisualboardError::Other(msg) => msg.clone(),
        other => other.to_string(),
    }
}

pub struct BackgroundRouter {
    tabs: Arc<dyn TabsApi>,
    site: ChatSite,
    retry_delay: Duration,
    events: broadcast::Sender<RuntimeMessage>,
}

impl BackgroundRouter {
    pub fn new(tabs: Arc<dyn TabsApi>, site: ChatSite, retry_delay: Duration) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tabs,
            site,
            retry_delay,
            events,
        }
    }

    pub fn from_config(tabs: Arc<dyn TabsApi>, config: &Config) -> Self {
        Self::new(
            tabs,
            ChatSite::new(config.content.host.clone()),
            config.reinject_retry_delay(),
        )
    }

    /// Extension-wide message stream every Side Panel listens on.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeMessage> {
        self.events.subscribe()
    }

    fn broadcast(&self, message: RuntimeMessage) {
        if self.events.send(message).is_err() {
            tracing::debug!("No side panel listening");
        }
    }

    /// Extension icon: open the Side Panel for that window.
    pub async fn on_action_clicked(&self, window_id: i64) -> Result<()> {
        self.tabs.open_side_panel(window_id).await
    }

    /// Tab started (re)loading: install the page hook on chat pages.
    pub async fn on_tab_loading(&self, tab_id: i64, url: &str) {
        if !self.site.is_chat_tab_url(url) {
            return;
        }
        if let Err(e) = self.tabs.inject_page_hook(tab_id).await {
            tracing::debug!("Page hook injection skipped for tab {}: {}", tab_id, e);
        }
    }

    /// Forward `REQUEST_LAST_AI_MESSAGE` to the active chat tab. Never fails;
    /// every problem is a typed `{ success: false, reason }` reply.
    pub async fn request_last_ai_message(&self, provider: &str) -> LastAiMessageResponse {
        tracing::debug!("REQUEST_LAST_AI_MESSAGE from side panel, provider {}", provider);

        let tab = match self.tabs.query_active_tab().await {
            Ok(tab) => tab,
            Err(e) => {
                tracing::error!("Active tab query failed: {}", e);
                return LastAiMessageResponse::failure(FailureReason::UnexpectedError);
            }
        };
        let Some(tab_id) = tab
            .filter(|t| t.url.as_deref().map(|u| self.site.is_chat_tab_url(u)).unwrap_or(false))
            .and_then(|t| t.id)
        else {
            tracing::warn!("No active chat tab");
            return LastAiMessageResponse::failure(FailureReason::NoActiveRofanChatTab);
        };

        if let Err(e) = self.tabs.inject_page_hook(tab_id).await {
            tracing::debug!("Page hook injection skipped for tab {}: {}", tab_id, e);
        }

        let request = LastAiMessageRequest {
            provider: provider.to_string(),
        };
        match self.tabs.send_message(tab_id, request.clone()).await {
            Ok(reply) => reply,
            Err(e) if is_missing_receiver(&e) => {
                tracing::info!("Content script missing in tab {}, injecting", tab_id);
                if let Err(inject_err) = self.tabs.inject_content_script(tab_id).await {
                    tracing::error!("Content script injection failed: {}", inject_err);
                    return LastAiMessageResponse::failure_with_error(
                        FailureReason::InjectionFailed,
                        error_text(&inject_err),
                    );
                }
                tokio::time::sleep(self.retry_delay).await;
                match self.tabs.send_message(tab_id, request).await {
                    Ok(reply) => reply,
                    Err(retry_err) => LastAiMessageResponse::failure_with_error(
                        FailureReason::ForwardErrorAfterInjection,
                        error_text(&retry_err),
                    ),
                }
            }
            Err(e) => {
                tracing::warn!("Forward to tab {} failed: {}", tab_id, e);
                LastAiMessageResponse::failure_with_error(FailureReason::ForwardError, error_text(&e))
            }
        }
    }

    /// Handle a push from a content script.
    pub fn handle_tab_message(&self, msg: TabMessage) {
        match msg.message {
            RuntimeMessage::NewLastAiTurn(turn) => {
                tracing::debug!(
                    "NEW_LAST_AI_TURN from tab {:?} window {:?}",
                    msg.sender.tab_id,
                    msg.sender.window_id
                );
                self.broadcast(RuntimeMessage::NewLastAiTurn(NewTurn {
                    source_tab_id: msg.sender.tab_id,
                    source_window_id: msg.sender.window_id,
                    ..turn
                }));
            }
            message @ (RuntimeMessage::TextSelected(_) | RuntimeMessage::AutoUpdateError(_)) => {
                self.broadcast(message);
            }
            other => {
                tracing::debug!("Ignoring {} from tab", other.kind());
            }
        }
    }

    /// Options page changed the server environment.
    pub fn announce_env_changed(&self, env: ServerEnv) {
        self.broadcast(RuntimeMessage::EnvChanged(EnvChanged {
            server_env: env.as_str().to_string(),
        }));
    }

    /// Drain content-script pushes until every sender is gone.
    pub fn run(self: &Arc<Self>, mut inbox: mpsc::UnboundedReceiver<TabMessage>) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                router.handle_tab_message(msg);
            }
        })
    }
}

#[async_trait]
impl RouterLink for BackgroundRouter {
    async fn request_last_ai_message(&self, provider: &str) -> Result<LastAiMessageResponse> {
        Ok(BackgroundRouter::request_last_ai_message(self, provider).await)
    }

    async fn active_tab_url(&self) -> Result<Option<String>> {
        Ok(self.tabs.query_active_tab().await?.and_then(|t| t.url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::runtime::{MessageSender, TextSelected};
    use mockall::Sequence;

    const CHAT_URL: &str = "https://rofan.ai/chat/abc";

    fn chat_tab() -> TabInfo {
        TabInfo {
            id: Some(7),
            window_id: 1,
            url: Some(CHAT_URL.to_string()),
        }
    }

    fn ok_reply() -> LastAiMessageResponse {
        LastAiMessageResponse {
            success: true,
            text: Some("hello".to_string()),
            ..Default::default()
        }
    }

    fn router(mock: MockTabsApi) -> BackgroundRouter {
        BackgroundRouter::new(Arc::new(mock), ChatSite::default(), Duration::from_millis(100))
    }

    fn missing_receiver() -> VisualboardError {
        VisualboardError::ChannelClosed(
            "Could not establish connection. Receiving end does not exist.".to_string(),
        )
    }

    #[tokio::test]
    async fn no_chat_tab_is_a_typed_failure() {
        let mut mock = MockTabsApi::new();
        mock.expect_query_active_tab().returning(|| {
            Ok(Some(TabInfo {
                id: Some(1),
                window_id: 1,
                url: Some("https://example.com/".to_string()),
            }))
        });
        mock.expect_send_message().never();

        let reply = router(mock).request_last_ai_message("rofan-ai").await;
        assert_eq!(reply.reason, Some(FailureReason::NoActiveRofanChatTab));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_content_script_is_injected_and_retried_once() {
        let mut mock = MockTabsApi::new();
        let mut seq = Sequence::new();
        mock.expect_query_active_tab().returning(|| Ok(Some(chat_tab())));
        mock.expect_inject_page_hook().returning(|_| Ok(()));
        mock.expect_send_message()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(missing_receiver()));
        mock.expect_inject_content_script()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_send_message()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(ok_reply()));

        let reply = router(mock).request_last_ai_message("rofan-ai").await;
        assert!(reply.success);
        assert_eq!(reply.text.as_deref(), Some("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_failure_is_surfaced_verbatim() {
        let mut mock = MockTabsApi::new();
        mock.expect_query_active_tab().returning(|| Ok(Some(chat_tab())));
        mock.expect_inject_page_hook().returning(|_| Ok(()));
        mock.expect_send_message()
            .times(2)
            .returning(|_, _| Err(missing_receiver()));
        mock.expect_inject_content_script().times(1).returning(|_| Ok(()));

        let reply = router(mock).request_last_ai_message("rofan-ai").await;
        assert_eq!(reply.reason, Some(FailureReason::ForwardErrorAfterInjection));
        assert_eq!(
            reply.error.as_deref(),
            Some("Could not establish connection. Receiving end does not exist.")
        );
    }

    #[tokio::test]
    async fn injection_and_other_forward_failures() {
        let mut mock = MockTabsApi::new();
        mock.expect_query_active_tab().returning(|| Ok(Some(chat_tab())));
        mock.expect_inject_page_hook().returning(|_| Ok(()));
        mock.expect_send_message().returning(|_, _| Err(missing_receiver()));
        mock.expect_inject_content_script()
            .returning(|_| Err(VisualboardError::Other("Cannot access a chrome:// URL".to_string())));
        let reply = router(mock).request_last_ai_message("rofan-ai").await;
        assert_eq!(reply.reason, Some(FailureReason::InjectionFailed));

        let mut mock = MockTabsApi::new();
        mock.expect_query_active_tab().returning(|| Ok(Some(chat_tab())));
        mock.expect_inject_page_hook().returning(|_| Ok(()));
        mock.expect_send_message()
            .times(1)
            .returning(|_, _| Err(VisualboardError::Other("Tab was discarded".to_string())));
        mock.expect_inject_content_script().never();
        let reply = router(mock).request_last_ai_message("rofan-ai").await;
        assert_eq!(reply.reason, Some(FailureReason::ForwardError));
        assert_eq!(reply.error.as_deref(), Some("Tab was discarded"));
    }

    #[tokio::test]
    async fn page_hook_injected_only_for_chat_urls() {
        let mut mock = MockTabsApi::new();
        mock.expect_inject_page_hook()
            .withf(|tab_id| *tab_id == 7)
            .times(1)
            .returning(|_| Ok(()));
        let router = router(mock);
        router.on_tab_loading(7, CHAT_URL).await;
        router.on_tab_loading(8, "https://rofan.ai/explore").await;
    }

    #[tokio::test]
    async fn turns_are_rebroadcast_with_window_ids() {
        let router = router(MockTabsApi::new());
        let mut rx = router.subscribe();

        router.handle_tab_message(TabMessage {
            sender: MessageSender {
                tab_id: Some(7),
                window_id: Some(2),
            },
            message: RuntimeMessage::NewLastAiTurn(NewTurn {
                provider: "rofan-ai".to_string(),
                text: "t".to_string(),
                user_text: None,
                ai_text: None,
                chat_id: None,
                scenario_key: None,
                source_tab_id: None,
                source_window_id: None,
            }),
        });
        router.handle_tab_message(TabMessage {
            sender: MessageSender::default(),
            message: RuntimeMessage::TextSelected(TextSelected {
                text: "sel".to_string(),
            }),
        });

        match rx.recv().await.unwrap() {
            RuntimeMessage::NewLastAiTurn(turn) => {
                assert_eq!(turn.source_tab_id, Some(7));
                assert_eq!(turn.source_window_id, Some(2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), RuntimeMessage::TextSelected(_)));
    }
}
