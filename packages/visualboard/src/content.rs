//! Content Bridge: the only context with DOM access.
//!
//! Watches the chat container for new turns, answers "last AI message"
//! requests, hydrates the turn log from embedded page data and relays page
//! hook output into storage. Once the extension runtime is invalidated the
//! bridge stops every observer and timer for good.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::dom::{latest_dom_turn, DomExtractor, DomTurn, PageData, PageDom};
use crate::error::{Result, VisualboardError, CONTEXT_INVALIDATED_NOTICE};
use crate::model::{now_millis, ChatId, ChatSite, TurnLogEntry};
use crate::page_hook::{PageHookMessage, PAGE_HOOK_SOURCE};
use crate::protocol::runtime::{
    AutoUpdateError, FailureReason, LastAiMessageRequest, LastAiMessageResponse, MessageSender,
    NewTurn, RuntimeMessage, TabMessage, TextSelected,
};
use crate::runtime::{guarded, RuntimeHandle};
use crate::storage::{ChatLogStore, GuardedStore, KeyValueStore};

const MISSING_RECEIVER: &str = "Could not establish connection. Receiving end does not exist.";
const PORT_CLOSED: &str = "The message port closed before a response was received.";

const FINGERPRINT_USER_CHARS: usize = 80;
const FINGERPRINT_AI_CHARS: usize = 200;

/// Outbound half of `runtime.sendMessage` for one tab.
#[derive(Debug, Clone)]
pub struct RuntimePort {
    tx: mpsc::UnboundedSender<TabMessage>,
    sender: MessageSender,
}

impl RuntimePort {
    pub fn new(tx: mpsc::UnboundedSender<TabMessage>, sender: MessageSender) -> Self {
        Self { tx, sender }
    }

    pub fn send(&self, message: RuntimeMessage) -> Result<()> {
        self.tx
            .send(TabMessage {
                sender: self.sender,
                message,
            })
            .map_err(|_| VisualboardError::ChannelClosed(MISSING_RECEIVER.to_string()))
    }
}

/// Request delivered to a tab's content script, answered over `reply`.
#[derive(Debug)]
pub struct ContentRequest {
    pub request: LastAiMessageRequest,
    pub reply: oneshot::Sender<LastAiMessageResponse>,
}

/// Handle the router uses to message one tab's bridge.
#[derive(Debug, Clone)]
pub struct ContentHandle {
    tx: mpsc::Sender<ContentRequest>,
}

impl ContentHandle {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ContentRequest>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    pub async fn request(&self, request: LastAiMessageRequest) -> Result<LastAiMessageResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ContentRequest { request, reply })
            .await
            .map_err(|_| VisualboardError::ChannelClosed(MISSING_RECEIVER.to_string()))?;
        rx.await
            .map_err(|_| VisualboardError::ChannelClosed(PORT_CLOSED.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone)]
pub struct ContentSettings {
    pub site: ChatSite,
    pub provider: String,
    pub mutation_debounce: Duration,
    pub min_request_interval: Duration,
    pub location_poll_interval: Duration,
    pub selection_mode: bool,
}

impl ContentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            site: ChatSite::new(config.content.host.clone()),
            provider: config.content.provider.clone(),
            mutation_debounce: config.mutation_debounce(),
            min_request_interval: config.min_request_interval(),
            location_poll_interval: config.location_poll_interval(),
            selection_mode: config.content.selection_mode,
        }
    }
}

impl Default for ContentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Result of one new-turn evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnCheck {
    Sent,
    NoTurn,
    Unchanged,
    Throttled,
    Stopped,
}

#[derive(Default)]
struct BridgeState {
    last_fingerprint: Option<String>,
    last_sent_at: Option<Instant>,
    last_checked_path: Option<String>,
    observer: Option<CancellationToken>,
}

pub struct ContentBridge {
    dom: Arc<dyn PageDom>,
    runtime: Arc<dyn RuntimeHandle>,
    logs: ChatLogStore,
    extractor: DomExtractor,
    port: RuntimePort,
    settings: ContentSettings,
    state: Mutex<BridgeState>,
    stopped: CancellationToken,
}

impl ContentBridge {
    pub fn new(
        dom: Arc<dyn PageDom>,
        store: Arc<dyn KeyValueStore>,
        runtime: Arc<dyn RuntimeHandle>,
        port: RuntimePort,
        settings: ContentSettings,
    ) -> Arc<Self> {
        let guarded_store: Arc<dyn KeyValueStore> =
            Arc::new(GuardedStore::new(store, runtime.clone()));
        let logs = ChatLogStore::new(guarded_store);
        let extractor = DomExtractor::new(settings.site.clone(), logs.clone());
        Arc::new(Self {
            dom,
            runtime,
            logs,
            extractor,
            port,
            settings,
            state: Mutex::new(BridgeState::default()),
            stopped: CancellationToken::new(),
        })
    }

    /// Start the request loop, page hook relay and location poller.
    pub fn attach(
        self: &Arc<Self>,
        mut requests: mpsc::Receiver<ContentRequest>,
        mut page_hook: mpsc::UnboundedReceiver<PageHookMessage>,
    ) -> JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move { poller.poll_location().await });

        let bridge = self.clone();
        tokio::spawn(async move {
            tracing::debug!("Content bridge attached to {}", bridge.dom.location());
            loop {
                tokio::select! {
                    _ = bridge.stopped.cancelled() => break,
                    Some(req) = requests.recv() => {
                        let reply = bridge.handle_request(&req.request).await;
                        let _ = req.reply.send(reply);
                    }
                    Some(msg) = page_hook.recv() => {
                        bridge.relay_page_hook(msg).await;
                    }
                    else => break,
                }
            }
            tracing::debug!("Content bridge detached");
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    pub async fn is_observing(&self) -> bool {
        self.state.lock().await.observer.is_some()
    }

    fn chat_id(&self) -> Option<ChatId> {
        self.settings.site.chat_id(&self.dom.location())
    }

    /// Answer `REQUEST_LAST_AI_MESSAGE`. Always responds, even before any
    /// turn exists.
    pub async fn handle_request(&self, request: &LastAiMessageRequest) -> LastAiMessageResponse {
        if request.provider != self.settings.provider {
            return LastAiMessageResponse::failure(FailureReason::UnsupportedProvider)
                .with_provider(request.provider.clone());
        }
        let location = self.dom.location();
        if !self.settings.site.is_chat_page(&location) {
            tracing::warn!("Not a chat page: {}", location);
            return LastAiMessageResponse::failure(FailureReason::NotRofanChatPage)
                .with_provider(request.provider.clone());
        }

        let result = self.extractor.extract(self.dom.as_ref()).await;
        result.into_response(&request.provider, self.settings.site.scenario_key(&location))
    }

    fn fingerprint(&self, turn: &DomTurn) -> String {
        let chat = self.chat_id().map(|c| c.to_string()).unwrap_or_default();
        let user: String = turn
            .user_text
            .as_deref()
            .unwrap_or("")
            .chars()
            .take(FINGERPRINT_USER_CHARS)
            .collect();
        let ai: String = turn.ai_text.chars().take(FINGERPRINT_AI_CHARS).collect();
        format!("{}|{}|{}", chat, user, ai)
    }

    /// Re-run the top extraction step and push the turn if it is new.
    pub async fn check_for_new_turn(&self) -> TurnCheck {
        if self.is_stopped() {
            return TurnCheck::Stopped;
        }
        let Some(turn) = latest_dom_turn(self.dom.as_ref()) else {
            return TurnCheck::NoTurn;
        };
        let fingerprint = self.fingerprint(&turn);

        {
            let mut state = self.state.lock().await;
            if state.last_fingerprint.as_deref() == Some(fingerprint.as_str())
                || turn.marker.as_deref() == Some(fingerprint.as_str())
            {
                return TurnCheck::Unchanged;
            }
            let now = Instant::now();
            if let Some(last) = state.last_sent_at {
                if now.duration_since(last) < self.settings.min_request_interval {
                    tracing::debug!("New turn throttled");
                    return TurnCheck::Throttled;
                }
            }
            state.last_fingerprint = Some(fingerprint.clone());
            state.last_sent_at = Some(now);
        }
        self.dom.mark_block(turn.block_index, &fingerprint);

        let location = self.dom.location();
        let chat_id = self.chat_id();
        let message = RuntimeMessage::NewLastAiTurn(NewTurn {
            provider: self.settings.provider.clone(),
            text: turn.text(),
            user_text: turn.user_text.clone(),
            ai_text: Some(turn.ai_text.clone()),
            chat_id: chat_id.as_ref().map(|c| c.to_string()),
            scenario_key: self.settings.site.scenario_key(&location),
            source_tab_id: None,
            source_window_id: None,
        });

        let port = self.port.clone();
        let sent = guarded(self.runtime.as_ref(), async move { port.send(message) }).await;
        if let Err(e) = sent {
            return self.on_privileged_error(e).await;
        }
        tracing::info!("New turn pushed ({} chars)", turn.ai_text.chars().count());

        if let Some(chat_id) = chat_id {
            let entry = TurnLogEntry {
                log_id: None,
                user_text: turn.user_text.clone(),
                assistant_text: Some(turn.ai_text.clone()),
                created_at: now_millis(),
            };
            if let Err(e) = self.logs.append_log(&chat_id, entry).await {
                self.on_privileged_error(e).await;
            }
        }
        TurnCheck::Sent
    }

    async fn on_privileged_error(&self, err: VisualboardError) -> TurnCheck {
        if err.is_context_invalidated() {
            self.fail_stop().await;
            return TurnCheck::Stopped;
        }
        tracing::warn!("Runtime call failed, still observing: {}", err);
        TurnCheck::Unchanged
    }

    /// Permanent stop after the extension runtime died under this page.
    pub async fn fail_stop(&self) {
        if self.stopped.is_cancelled() {
            return;
        }
        self.teardown_observer().await;
        self.stopped.cancel();
        tracing::warn!("Extension context invalidated; content bridge stopped");

        // Best effort: the router may still be reachable from its side.
        let _ = self.port.send(RuntimeMessage::AutoUpdateError(AutoUpdateError {
            provider: self.settings.provider.clone(),
            reason: FailureReason::ContextInvalidated,
            message: CONTEXT_INVALIDATED_NOTICE.to_string(),
        }));
    }

    /// Attach the mutation observer once; bursts collapse into one
    /// evaluation after the quiet period.
    pub async fn setup_observer(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        let mut state = self.state.lock().await;
        if state.observer.is_some() {
            return;
        }
        let Some(mutations) = self.dom.observe_chat_root() else {
            tracing::warn!("Chat root not found; observer not attached");
            return;
        };
        let token = self.stopped.child_token();
        state.observer = Some(token.clone());
        drop(state);

        let bridge = self.clone();
        tokio::spawn(async move { bridge.observe(mutations, token).await });
        tracing::debug!("Mutation observer attached");
    }

    async fn observe(self: Arc<Self>, mut mutations: broadcast::Receiver<()>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                event = mutations.recv() => {
                    if matches!(event, Err(broadcast::error::RecvError::Closed)) {
                        return;
                    }
                }
            }

            // Debounce: wait for a quiet period.
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(self.settings.mutation_debounce) => break,
                    event = mutations.recv() => {
                        if matches!(event, Err(broadcast::error::RecvError::Closed)) {
                            return;
                        }
                    }
                }
            }

            if self.check_for_new_turn().await == TurnCheck::Stopped {
                return;
            }
        }
    }

    pub async fn teardown_observer(&self) {
        let mut state = self.state.lock().await;
        if let Some(token) = state.observer.take() {
            token.cancel();
            state.last_fingerprint = None;
            tracing::debug!("Mutation observer detached");
        }
    }

    async fn poll_location(self: Arc<Self>) {
        self.check_location().await;
        loop {
            tokio::select! {
                _ = self.stopped.cancelled() => return,
                _ = tokio::time::sleep(self.settings.location_poll_interval) => {
                    self.check_location().await;
                }
            }
        }
    }

    /// Re-establish observer and hydration when the SPA path changed.
    /// Returns false when the path is unchanged.
    pub async fn check_location(self: &Arc<Self>) -> bool {
        if self.is_stopped() {
            return false;
        }
        let location = self.dom.location();
        let path = Url::parse(&location)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| location.clone());
        {
            let mut state = self.state.lock().await;
            if state.last_checked_path.as_deref() == Some(path.as_str()) {
                return false;
            }
            state.last_checked_path = Some(path.clone());
        }

        self.teardown_observer().await;
        if self.settings.site.is_chat_page(&location) {
            tracing::info!("Entered chat page {}", path);
            if let Err(e) = self.hydrate().await {
                self.on_privileged_error(e).await;
            }
            self.setup_observer().await;
        } else {
            tracing::debug!("Left chat page, now at {}", path);
        }
        true
    }

    /// One-time import of the page-embedded history and bot metadata.
    pub async fn hydrate(&self) -> Result<()> {
        let Some(chat_id) = self.chat_id() else {
            return Ok(());
        };
        let Some(data) = self.dom.page_data().and_then(|raw| PageData::parse(&raw)) else {
            return Ok(());
        };

        if let Some(meta) = data.bot_metadata() {
            self.logs.save_metadata(&meta).await?;
        }
        if let Some(first) = data.first_message().filter(|t| !t.is_empty()) {
            if self.logs.first_message(&chat_id).await?.is_none() {
                self.logs.save_first_message(&chat_id, &first).await?;
            }
        }
        if self.logs.is_initialized(&chat_id).await? {
            return Ok(());
        }
        let entries = data.turn_logs(now_millis());
        if !entries.is_empty() {
            self.logs.save_logs(&chat_id, &entries).await?;
        }
        self.logs.mark_initialized(&chat_id).await?;
        tracing::info!("Hydrated {} turn log entries for chat {}", entries.len(), chat_id);
        Ok(())
    }

    /// Persist metadata published by the page hook.
    pub async fn relay_page_hook(&self, message: PageHookMessage) {
        if message.source != PAGE_HOOK_SOURCE || self.is_stopped() {
            return;
        }
        if let Err(e) = self.logs.save_metadata(&message.payload).await {
            self.on_privileged_error(e).await;
        }
    }

    /// Legacy selection relay, off unless selection mode is enabled.
    pub async fn on_text_selected(&self, text: &str) {
        let text = text.trim();
        if !self.settings.selection_mode || text.is_empty() || self.is_stopped() {
            return;
        }
        let port = self.port.clone();
        let message = RuntimeMessage::TextSelected(TextSelected {
            text: text.to_string(),
        });
        if let Err(e) = guarded(self.runtime.as_ref(), async move { port.send(message) }).await {
            self.on_privileged_error(e).await;
        }
    }
}
